//! Access-log event model shared by the producer and the indexer.

pub mod access_log;

pub use access_log::{AccessLogEvent, AccessLogEventBuilder, CodecError};
