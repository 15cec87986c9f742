//! Consumer group tests against the in-memory broker and index.

use std::sync::Arc;
use std::time::Duration;

use accesslog_pipeline::broker::{Broker, MemoryBroker, ProducerRecord, Publish};
use accesslog_pipeline::config::BrokerConfig;
use accesslog_pipeline::consumer::{ConsumerGroup, WorkerSettings, WorkerState};
use accesslog_pipeline::event::AccessLogEvent;
use accesslog_pipeline::index::{BatchLimits, MemoryIndex};
use accesslog_pipeline::lifecycle::Shutdown;
use accesslog_pipeline::producer::AccessLogProducer;
use accesslog_pipeline::resilience::RetryPolicy;
use bytes::Bytes;

mod common;

const GROUP: &str = "indexers";
const INDEX: &str = "accesslog";

fn settings(commit_interval: Duration) -> WorkerSettings {
    WorkerSettings {
        group_id: GROUP.to_string(),
        topic: common::TOPIC.to_string(),
        index: INDEX.to_string(),
        limits: BatchLimits {
            max_actions: 1000,
            max_bytes: 5 * 1024 * 1024,
            flush_interval: Duration::from_millis(50),
        },
        index_retry: RetryPolicy::new(3, 1, 5),
        commit_interval,
    }
}

fn event(ip: &str, seq: usize) -> AccessLogEvent {
    AccessLogEvent::builder()
        .method("GET")
        .path(format!("/seq/{seq}"))
        .ip(ip)
        .tag("seq", seq.to_string())
        .build()
}

async fn publish_events(broker: &MemoryBroker, count: usize) {
    let publisher = broker.publisher().unwrap();
    for i in 0..count {
        let ip = format!("10.0.{}.{}", i % 7, i % 13);
        let event = event(&ip, i);
        publisher
            .publish(ProducerRecord {
                topic: common::TOPIC.to_string(),
                key: ip,
                payload: event.encode().unwrap(),
            })
            .await
            .unwrap();
    }
}

async fn wait_running(group: &ConsumerGroup) {
    for worker in group.workers() {
        let mut state = worker.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == WorkerState::Running),
        )
        .await
        .expect("worker never ran")
        .unwrap();
    }
}

#[tokio::test]
async fn test_same_key_events_arrive_in_production_order() {
    let broker = MemoryBroker::new(4, Duration::from_secs(10));
    let config = BrokerConfig {
        topic: common::TOPIC.to_string(),
        ..BrokerConfig::default()
    };
    let (producer, handle) = AccessLogProducer::spawn(broker.publisher().unwrap(), &config);

    let clients = ["10.1.0.1", "10.1.0.2", "10.1.0.3"];
    for seq in 0..60 {
        let ip = clients[seq % clients.len()];
        assert!(producer.produce(&event(ip, seq), ip));
    }
    handle.close().await;

    let events = common::read_events(&broker, 60).await;
    for ip in clients {
        let seqs: Vec<usize> = events
            .iter()
            .filter(|e| e.ip() == ip)
            .map(|e| e.tags()["seq"].parse().unwrap())
            .collect();
        assert_eq!(seqs.len(), 20);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{ip} out of order: {seqs:?}");
    }
}

#[tokio::test]
async fn test_same_key_order_survives_a_retried_publish() {
    let broker = MemoryBroker::new(1, Duration::from_secs(10));
    broker.fail_next_publishes(1);
    let config = BrokerConfig {
        topic: common::TOPIC.to_string(),
        retry_base_delay_ms: 50,
        retry_max_delay_ms: 50,
        ..BrokerConfig::default()
    };
    let (producer, handle) = AccessLogProducer::spawn(broker.publisher().unwrap(), &config);

    for seq in 0..3 {
        assert!(producer.produce(&event("10.9.9.9", seq), "10.9.9.9"));
    }
    let stats = handle.close().await;
    assert_eq!(stats.published, 3);

    let seqs: Vec<String> = common::read_events(&broker, 3)
        .await
        .iter()
        .map(|e| e.tags()["seq"].clone())
        .collect();
    assert_eq!(seqs, ["0", "1", "2"]);
}

#[tokio::test]
async fn test_malformed_message_does_not_block_the_next_one() {
    let broker = MemoryBroker::new(1, Duration::from_secs(10));
    let publisher = broker.publisher().unwrap();
    let good = event("10.2.0.1", 1);
    for payload in [Bytes::from_static(b"\x00garbage"), good.encode().unwrap()] {
        publisher
            .publish(ProducerRecord {
                topic: common::TOPIC.to_string(),
                key: "10.2.0.1".to_string(),
                payload,
            })
            .await
            .unwrap();
    }

    let index = Arc::new(MemoryIndex::new());
    let shutdown = Shutdown::new();
    let group = ConsumerGroup::spawn(
        1,
        &broker,
        index.clone(),
        &settings(Duration::from_millis(20)),
        &shutdown,
    )
    .unwrap();

    assert!(common::wait_until(Duration::from_secs(5), || index.document_count(INDEX) == 1).await);
    assert!(index.document(INDEX, &good.document_id()).is_some());

    shutdown.trigger();
    let reports = group.join().await;
    assert_eq!(reports[0].decode_failures, 1);
    assert_eq!(broker.committed_offset(GROUP, 0), Some(2));
}

#[tokio::test]
async fn test_group_indexes_every_event_and_commits_on_shutdown() {
    let broker = MemoryBroker::new(6, Duration::from_secs(10));
    let index = Arc::new(MemoryIndex::new());
    let shutdown = Shutdown::new();
    let group = ConsumerGroup::spawn(
        3,
        &broker,
        index.clone(),
        &settings(Duration::from_secs(60)),
        &shutdown,
    )
    .unwrap();
    wait_running(&group).await;

    publish_events(&broker, 300).await;
    assert!(common::wait_until(Duration::from_secs(5), || index.document_count(INDEX) == 300).await);

    shutdown.trigger();
    let reports = group.join().await;
    assert_eq!(reports.len(), 3);
    assert_eq!(reports.iter().map(|r| r.consumed).sum::<u64>(), 300);
    assert_eq!(reports.iter().map(|r| r.writer.indexed).sum::<u64>(), 300);

    for partition in 0..6 {
        let produced = broker.partition_len(common::TOPIC, partition) as u64;
        let committed = broker.committed_offset(GROUP, partition).unwrap_or(0);
        assert_eq!(committed, produced, "partition {partition}");
    }
    assert!(broker.members(GROUP).is_empty());
}

#[tokio::test]
async fn test_killed_worker_is_redelivered_without_duplicates() {
    let broker = MemoryBroker::new(4, Duration::from_millis(300));
    let index = Arc::new(MemoryIndex::new());
    let shutdown = Shutdown::new();
    // Nothing is committed before shutdown, so the kill loses every mark.
    let group = ConsumerGroup::spawn(
        2,
        &broker,
        index.clone(),
        &settings(Duration::from_secs(60)),
        &shutdown,
    )
    .unwrap();
    wait_running(&group).await;
    assert!(common::wait_until(Duration::from_secs(5), || broker.generation(GROUP) == 2).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    publish_events(&broker, 100).await;
    assert!(common::wait_until(Duration::from_secs(5), || index.document_count(INDEX) == 100).await);

    // The first member sorts first and owns partitions 0 and 1.
    let killed = &group.workers()[0];
    let redelivered =
        broker.partition_len(common::TOPIC, 0) + broker.partition_len(common::TOPIC, 1);
    killed.kill();

    assert!(common::wait_until(Duration::from_secs(5), || broker.members(GROUP).len() == 1).await);
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            index.bulk_sizes().iter().sum::<usize>() == 100 + redelivered
        })
        .await
    );
    assert_eq!(index.document_count(INDEX), 100);

    shutdown.trigger();
    let reports = group.join().await;
    assert_eq!(reports.len(), 1);
    let survivor = &reports[0];
    assert_eq!(survivor.consumed, 100);
    assert!(survivor.rebalances >= 2);

    for partition in 0..4 {
        let produced = broker.partition_len(common::TOPIC, partition) as u64;
        assert_eq!(broker.committed_offset(GROUP, partition).unwrap_or(0), produced);
    }
}

#[tokio::test]
async fn test_kill_before_flush_redelivers_the_open_batch() {
    let broker = MemoryBroker::new(4, Duration::from_millis(300));
    let index = Arc::new(MemoryIndex::new());
    let shutdown = Shutdown::new();
    let mut settings = settings(Duration::from_millis(50));
    settings.limits.flush_interval = Duration::from_secs(60);

    let group = ConsumerGroup::spawn(2, &broker, index.clone(), &settings, &shutdown).unwrap();
    wait_running(&group).await;
    assert!(common::wait_until(Duration::from_secs(5), || broker.generation(GROUP) == 2).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    publish_events(&broker, 100).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Handed off to the writers but neither written nor committed.
    assert_eq!(index.document_count(INDEX), 0);
    for partition in 0..4 {
        assert_eq!(broker.committed_offset(GROUP, partition), None);
    }

    group.workers()[0].kill();
    assert!(common::wait_until(Duration::from_secs(5), || broker.members(GROUP).len() == 1).await);
    assert!(common::wait_until(Duration::from_secs(5), || broker.generation(GROUP) >= 3).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    shutdown.trigger();
    let reports = group.join().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].consumed, 100);

    // The killed batch never reached the index, so every document is written once.
    assert_eq!(index.bulk_sizes(), vec![100]);
    assert_eq!(index.document_count(INDEX), 100);
    for partition in 0..4 {
        let produced = broker.partition_len(common::TOPIC, partition) as u64;
        assert_eq!(broker.committed_offset(GROUP, partition).unwrap_or(0), produced);
    }
}

#[tokio::test]
async fn test_joining_member_triggers_rebalance() {
    let broker = MemoryBroker::new(4, Duration::from_secs(10));
    let index = Arc::new(MemoryIndex::new());
    let shutdown = Shutdown::new();

    let first = ConsumerGroup::spawn(
        1,
        &broker,
        index.clone(),
        &settings(Duration::from_millis(50)),
        &shutdown,
    )
    .unwrap();
    wait_running(&first).await;
    let generation = broker.generation(GROUP);

    let second = ConsumerGroup::spawn(
        1,
        &broker,
        index.clone(),
        &settings(Duration::from_millis(50)),
        &shutdown,
    )
    .unwrap();
    wait_running(&second).await;

    assert!(broker.generation(GROUP) > generation);
    assert_eq!(broker.members(GROUP).len(), 2);

    publish_events(&broker, 40).await;
    assert!(common::wait_until(Duration::from_secs(5), || index.document_count(INDEX) == 40).await);

    shutdown.trigger();
    let consumed: u64 = first
        .join()
        .await
        .into_iter()
        .chain(second.join().await)
        .map(|r| r.consumed)
        .sum();
    assert_eq!(consumed, 40);
}
