//! Partitioned consumer group subsystem.
//!
//! # Data Flow
//! ```text
//! broker::GroupConsumer::pull
//!     → worker.rs (decode; malformed → log, skip, still mark)
//!     → index::BatchIndexWriter::add
//!     → mark offset (committed every commit_interval and on close)
//! ```
//!
//! # Design Decisions
//! - Each worker owns its broker session, batch writer, and search backend
//! - Delivery is at-least-once; documents are upserted by trace number so
//!   redelivery does not create duplicates
//! - Drain order: stop pulling, close the broker session (final commit and
//!   leave), close the batch writer (final flush), drop the backend

pub mod group;
pub mod worker;

pub use group::{ConsumerGroup, WorkerHandle};
pub use worker::{ConsumerWorker, WorkerReport, WorkerSettings, WorkerState};
