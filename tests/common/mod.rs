//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accesslog_pipeline::broker::{Broker, ConsumerEvent, GroupConsumer, MemoryBroker};
use accesslog_pipeline::config::{BrokerKind, PipelineConfig};
use accesslog_pipeline::event::AccessLogEvent;
use accesslog_pipeline::lifecycle::startup::run_edge;
use accesslog_pipeline::lifecycle::Shutdown;
use accesslog_pipeline::observability::Telemetry;
use accesslog_pipeline::producer::PublisherStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TOPIC: &str = "accesslog";

/// Config for an edge service on `addr` backed by the in-memory broker.
pub fn edge_config(addr: SocketAddr, downstream: Option<String>) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.service.bind_address = addr.to_string();
    config.service.downstream_url = downstream;
    config.service.request_timeout_secs = 5;
    config.service.message_len = 16;
    config.broker.kind = BrokerKind::Memory;
    config.broker.topic = TOPIC.to_string();
    config.broker.retry_base_delay_ms = 1;
    config.broker.retry_max_delay_ms = 5;
    config.observability.metrics_enabled = false;
    config
}

pub struct Edge {
    pub shutdown: Shutdown,
    pub task: JoinHandle<PublisherStats>,
}

impl Edge {
    /// Stop the server, drain the producer, and return its totals.
    pub async fn stop(self) -> PublisherStats {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("edge did not stop")
            .unwrap()
    }
}

/// Start an edge service publishing to `broker`. Returns once it is listening.
pub async fn start_edge(config: PipelineConfig, broker: &MemoryBroker) -> Edge {
    let listener = TcpListener::bind(&config.service.bind_address).await.unwrap();
    let shutdown = Shutdown::new();
    let telemetry = Telemetry::local("edge-test");
    let propagator = telemetry.propagator();

    let broker = broker.clone();
    let server_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        let stats = run_edge(&config, &broker, propagator, listener, &server_shutdown)
            .await
            .unwrap();
        telemetry.shutdown();
        stats
    });

    Edge { shutdown, task }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Read `count` events from the topic with a fresh consumer group.
pub async fn read_events(broker: &MemoryBroker, count: usize) -> Vec<AccessLogEvent> {
    let group = format!("inspect-{}", uuid::Uuid::new_v4());
    let mut consumer = broker.join_group(&group, TOPIC).unwrap();
    let mut events = Vec::with_capacity(count);

    tokio::time::timeout(Duration::from_secs(5), async {
        while events.len() < count {
            if let ConsumerEvent::Message(message) = consumer.pull().await {
                events.push(AccessLogEvent::decode(&message.payload).unwrap());
            }
        }
    })
    .await
    .expect("events not delivered");

    consumer.close().await.unwrap();
    events
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Start a downstream that answers 200 and records each request's `traceparent`.
pub async fn start_capturing_downstream(addr: SocketAddr) -> Arc<Mutex<Vec<Option<String>>>> {
    let listener = TcpListener::bind(addr).await.unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let mut buf = Vec::new();
                        let mut chunk = [0u8; 1024];
                        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        }

                        let head = String::from_utf8_lossy(&buf);
                        let traceparent = head.lines().find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.trim()
                                .eq_ignore_ascii_case("traceparent")
                                .then(|| value.trim().to_string())
                        });
                        sink.lock().unwrap().push(traceparent);

                        let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    captured
}

/// Start a downstream that accepts connections and never answers.
pub async fn start_silent_downstream(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
}
