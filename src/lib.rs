//! Trace-aware access-log pipeline.
//!
//! An instrumented HTTP edge service emits one access-log event per request
//! into a partitioned log broker; a consumer group reads the partitions and
//! bulk-indexes the events into a search backend.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod event;
pub mod http;
pub mod index;
pub mod lifecycle;
pub mod observability;
pub mod producer;
pub mod resilience;

pub use config::schema::PipelineConfig;
pub use event::AccessLogEvent;
pub use http::EdgeServer;
pub use lifecycle::Shutdown;
