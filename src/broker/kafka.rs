//! Kafka client built on rdkafka.
//!
//! Producer: `FutureProducer`, leader-only acks, snappy compression, batched by
//! `linger.ms`. Consumer: `StreamConsumer` in a group with offset storage
//! under our control and background auto-commit of stored offsets.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::Message;
use tokio::sync::mpsc;

use crate::broker::{
    Broker, BrokerError, BrokerMessage, ConsumerEvent, GroupConsumer, PartitionId, Publish,
    ProducerRecord, RebalanceCallback, RebalanceEvent,
};
use crate::config::BrokerConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn classify(error: KafkaError) -> BrokerError {
    use RDKafkaErrorCode::*;
    match error.rdkafka_error_code() {
        Some(QueueFull) => BrokerError::QueueFull,
        Some(MessageTimedOut | RequestTimedOut | OperationTimedOut) => BrokerError::Timeout,
        Some(
            AllBrokersDown
            | BrokerTransportFailure
            | NetworkException
            | BrokerNotAvailable
            | LeaderNotAvailable
            | NotLeaderForPartition
            | NotCoordinator
            | CoordinatorNotAvailable,
        ) => BrokerError::Unavailable(error.to_string()),
        _ => BrokerError::Client(error.to_string()),
    }
}

/// Connection settings for a Kafka cluster.
#[derive(Debug, Clone)]
pub struct KafkaBroker {
    config: BrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        if config.brokers.is_empty() {
            return Err(BrokerError::Config("no brokers configured".to_string()));
        }
        Ok(Self { config })
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", self.config.brokers.join(","));
        client
    }
}

impl Broker for KafkaBroker {
    type Publisher = KafkaPublisher;
    type Consumer = KafkaConsumer;

    async fn ping(&self) -> Result<(), BrokerError> {
        let consumer: BaseConsumer = self.client_config().create().map_err(classify)?;
        let topic = self.config.topic.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                .map(|_| ())
                .map_err(classify)
        })
        .await
        .map_err(|e| BrokerError::Client(e.to_string()))?
    }

    fn publisher(&self) -> Result<KafkaPublisher, BrokerError> {
        let producer: FutureProducer = self
            .client_config()
            .set("acks", "1")
            .set("compression.type", "snappy")
            .set("linger.ms", self.config.flush_frequency_ms.to_string())
            .set("message.send.max.retries", self.config.max_retries.to_string())
            .set("partitioner", "murmur2_random")
            .create()
            .map_err(classify)?;
        Ok(KafkaPublisher { producer })
    }

    fn join_group(&self, group_id: &str, topic: &str) -> Result<KafkaConsumer, BrokerError> {
        let member_id = format!("{group_id}-{}", uuid::Uuid::new_v4());
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            assigned: Arc::new(Mutex::new(BTreeSet::new())),
            rebalance_tx,
        };
        let assigned = context.assigned.clone();

        let consumer: StreamConsumer<GroupContext> = self
            .client_config()
            .set("group.id", group_id)
            .set("client.id", &member_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.commit.interval.ms", self.config.commit_interval_ms.to_string())
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("auto.offset.reset", "earliest")
            .create_with_context(context)
            .map_err(classify)?;
        consumer.subscribe(&[topic]).map_err(classify)?;

        tracing::info!(member = %member_id, group = group_id, topic, "Subscribed to Kafka topic");

        Ok(KafkaConsumer {
            consumer: Arc::new(consumer),
            member_id,
            topic: topic.to_string(),
            assigned,
            rebalance_rx,
            on_rebalance: None,
            generation: 0,
        })
    }
}

/// Producer handle; clones share one rdkafka client.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl Publish for KafkaPublisher {
    async fn publish(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        let delivery = self
            .producer
            .send(
                FutureRecord::to(&record.topic)
                    .key(record.key.as_bytes())
                    .payload(record.payload.as_ref()),
                Timeout::After(SEND_TIMEOUT),
            )
            .await;
        delivery.map(|_| ()).map_err(|(e, _)| classify(e))
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))?
            .map_err(classify)
    }
}

/// Forwards partition ownership changes out of the rdkafka poll thread.
struct GroupContext {
    assigned: Arc<Mutex<BTreeSet<PartitionId>>>,
    rebalance_tx: mpsc::UnboundedSender<(Vec<PartitionId>, Vec<PartitionId>)>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let (assigned, revoked): (Vec<PartitionId>, Vec<PartitionId>) = match rebalance {
            Rebalance::Assign(list) => (
                list.elements().iter().map(|e| e.partition() as PartitionId).collect(),
                Vec::new(),
            ),
            Rebalance::Revoke(list) => (
                Vec::new(),
                list.elements().iter().map(|e| e.partition() as PartitionId).collect(),
            ),
            Rebalance::Error(e) => {
                tracing::warn!(error = %e, "Rebalance failed");
                return;
            }
        };

        if let Ok(mut owned) = self.assigned.lock() {
            owned.extend(assigned.iter().copied());
            for p in &revoked {
                owned.remove(p);
            }
        }
        let _ = self.rebalance_tx.send((assigned, revoked));
    }
}

pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer<GroupContext>>,
    member_id: String,
    topic: String,
    assigned: Arc<Mutex<BTreeSet<PartitionId>>>,
    rebalance_rx: mpsc::UnboundedReceiver<(Vec<PartitionId>, Vec<PartitionId>)>,
    on_rebalance: Option<RebalanceCallback>,
    generation: u64,
}

impl KafkaConsumer {
    fn rebalanced(&mut self, assigned: Vec<PartitionId>, revoked: Vec<PartitionId>) -> ConsumerEvent {
        self.generation += 1;
        let event = RebalanceEvent {
            generation: self.generation,
            assigned,
            revoked,
        };
        if let Some(callback) = &self.on_rebalance {
            callback(&event);
        }
        ConsumerEvent::Rebalanced(event)
    }
}

impl GroupConsumer for KafkaConsumer {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn assigned_partitions(&self) -> Vec<PartitionId> {
        self.assigned
            .lock()
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default()
    }

    fn on_rebalance(&mut self, callback: RebalanceCallback) {
        self.on_rebalance = Some(callback);
    }

    async fn pull(&mut self) -> ConsumerEvent {
        if let Ok((assigned, revoked)) = self.rebalance_rx.try_recv() {
            return self.rebalanced(assigned, revoked);
        }

        let consumer = self.consumer.clone();
        tokio::select! {
            Some((assigned, revoked)) = self.rebalance_rx.recv() => self.rebalanced(assigned, revoked),
            received = consumer.recv() => match received {
                Ok(message) => ConsumerEvent::Message(BrokerMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition() as PartitionId,
                    offset: message.offset().max(0) as u64,
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned()),
                    payload: bytes::Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                }),
                Err(e) => ConsumerEvent::Error(classify(e)),
            },
        }
    }

    fn mark_offset(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        self.consumer
            .store_offset(&self.topic, message.partition as i32, message.offset as i64 + 1)
            .map_err(classify)
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        match self.consumer.commit_consumer_state(CommitMode::Async) {
            Ok(()) => Ok(()),
            // Nothing stored since the last commit.
            Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn close(self) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let member_id = self.member_id.clone();
        tokio::task::spawn_blocking(move || {
            let committed = match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => Ok(()),
                Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => Ok(()),
                Err(e) => Err(classify(e)),
            };
            consumer.unsubscribe();
            committed
        })
        .await
        .map_err(|e| BrokerError::Client(e.to_string()))??;
        tracing::info!(member = %member_id, "Left Kafka consumer group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_bootstrap_servers() {
        let config = BrokerConfig::default();
        assert!(matches!(KafkaBroker::new(config), Err(BrokerError::Config(_))));
    }

    #[test]
    fn maps_error_codes_to_retry_classes() {
        let full = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert!(classify(full).is_transient());

        let down = KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown);
        assert!(matches!(classify(down), BrokerError::Unavailable(_)));

        let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(!classify(too_large).is_transient());
    }

    #[tokio::test]
    async fn publisher_builds_without_connecting() {
        let mut config = BrokerConfig::default();
        config.brokers = vec!["127.0.0.1:1".to_string()];
        let broker = KafkaBroker::new(config).unwrap();
        assert!(broker.publisher().is_ok());
    }
}
