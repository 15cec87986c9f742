//! Event producer subsystem.
//!
//! # Data Flow
//! ```text
//! Edge handler
//!     → access_log.rs (encode once, try_send into bounded queue; full → drop)
//!     → publisher.rs (background task, bounded in-flight sends)
//!     → broker::Publish (retried while transient, then dropped)
//! ```
//!
//! # Design Decisions
//! - The request path never waits on the broker
//! - Partition key is the client address, so one client's events stay ordered
//! - Close drains the queue before flushing the broker client

pub mod access_log;
pub mod publisher;

pub use access_log::{AccessLogProducer, ProducerHandle};
pub use publisher::PublisherStats;
