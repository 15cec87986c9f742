//! Log broker subsystem.
//!
//! # Data Flow
//! ```text
//! Producer side:
//!     ProducerRecord → Publish::publish → partition(key) → append
//!
//! Consumer side:
//!     Broker::join_group → GroupConsumer::pull
//!         → Rebalanced (generation bump, partitions assigned/revoked)
//!         → Message (ordered within its partition)
//!     mark_offset (local) → commit (durable, owned partitions only)
//! ```
//!
//! # Design Decisions
//! - Two implementations behind the same traits: Kafka via rdkafka, and an
//!   in-process broker with a real group coordinator for tests and local runs
//! - Offsets are marked per message and committed in batches; anything marked
//!   but not committed is redelivered if the member dies
//! - Errors say whether they are worth retrying

pub mod kafka;
pub mod memory;
pub mod partitioner;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

pub use kafka::KafkaBroker;
pub use memory::{MemoryBroker, MemoryConsumer, MemoryPublisher};

pub type PartitionId = u32;

/// A record handed to the broker for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

/// A record delivered to a group member.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Bytes,
}

/// A change in this member's partition ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceEvent {
    pub generation: u64,
    pub assigned: Vec<PartitionId>,
    pub revoked: Vec<PartitionId>,
}

#[derive(Debug)]
pub enum ConsumerEvent {
    Message(BrokerMessage),
    Error(BrokerError),
    Rebalanced(RebalanceEvent),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker request timed out")]
    Timeout,

    #[error("client send queue is full")]
    QueueFull,

    #[error("partition {0} is not assigned to this member")]
    NotAssigned(PartitionId),

    #[error("member {0} is not part of the group")]
    UnknownMember(String),

    #[error("consumer is closed")]
    Closed,

    #[error("invalid broker configuration: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Client(String),
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::Timeout | BrokerError::QueueFull
        )
    }
}

/// Called with every ownership change, before the change is returned from `pull`.
pub type RebalanceCallback = Arc<dyn Fn(&RebalanceEvent) + Send + Sync>;

/// Sends records to the broker.
pub trait Publish: Send + Sync + 'static {
    fn publish(
        &self,
        record: ProducerRecord,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Wait until buffered records are delivered or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// One member of a consumer group.
pub trait GroupConsumer: Send + 'static {
    fn member_id(&self) -> &str;

    fn assigned_partitions(&self) -> Vec<PartitionId>;

    fn on_rebalance(&mut self, callback: RebalanceCallback);

    /// Next message, error, or ownership change. Also keeps the membership alive.
    fn pull(&mut self) -> impl Future<Output = ConsumerEvent> + Send;

    /// Record `message` as processed. Not durable until [`GroupConsumer::commit`].
    fn mark_offset(&mut self, message: &BrokerMessage) -> Result<(), BrokerError>;

    fn commit(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Commit outstanding marks and leave the group.
    fn close(self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Entry point to a broker cluster.
pub trait Broker: Send + Sync + 'static {
    type Publisher: Publish;
    type Consumer: GroupConsumer;

    /// Check that the cluster is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn publisher(&self) -> Result<Self::Publisher, BrokerError>;

    fn join_group(&self, group_id: &str, topic: &str) -> Result<Self::Consumer, BrokerError>;
}

impl fmt::Display for RebalanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generation {} (+{:?} -{:?})",
            self.generation, self.assigned, self.revoked
        )
    }
}
