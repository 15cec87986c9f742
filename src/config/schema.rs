//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the pipeline.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the access-log pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Instrumented edge service settings.
    pub service: ServiceConfig,

    /// Distributed tracing settings.
    pub tracing: TracingConfig,

    /// Log broker settings (producer and consumer side).
    pub broker: BrokerConfig,

    /// Consumer group settings.
    pub consumer: ConsumerConfig,

    /// Search backend and bulk writer settings.
    pub search: SearchConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Edge service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional downstream service called on every request (must be `http://`).
    pub downstream_url: Option<String>,

    /// Maximum idle keep-alive connections per downstream host.
    pub max_idle_conns_per_host: usize,

    /// Request timeout (total time for request/response) in seconds.
    pub request_timeout_secs: u64,

    /// Timeout for the downstream call in milliseconds. Must stay below the
    /// request timeout so a slow downstream still leaves time to log the event.
    pub downstream_timeout_ms: u64,

    /// Length of the random payload attached to each access-log event.
    pub message_len: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            downstream_url: None,
            max_idle_conns_per_host: 100,
            request_timeout_secs: 30,
            downstream_timeout_ms: 10_000,
            message_len: 128,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Capped at half the request timeout.
    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms).min(self.request_timeout() / 2)
    }
}

/// Tracing backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// OTLP collector endpoint (e.g., "http://localhost:4317"). Empty disables export.
    pub endpoint: String,

    /// Service name reported with every span.
    pub service_name: String,

    /// Fraction of root traces sampled (0.0 - 1.0).
    pub sample_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            service_name: "accesslog-edge".to_string(),
            sample_ratio: 1.0,
        }
    }
}

/// Which broker client to use.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Apache Kafka (or a protocol-compatible broker).
    Kafka,
    /// In-process broker, useful for local runs.
    Memory,
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker client implementation.
    pub kind: BrokerKind,

    /// Bootstrap broker addresses ("host:port").
    pub brokers: Vec<String>,

    /// Topic access-log events are published to.
    pub topic: String,

    /// Consumer group id shared by all indexer workers.
    pub group_id: String,

    /// Partition count for the in-process broker.
    pub partitions: u32,

    /// Capacity of the producer's internal send queue.
    pub send_buffer: usize,

    /// Producer micro-batch flush frequency in milliseconds.
    pub flush_frequency_ms: u64,

    /// Maximum send attempts for a transient failure before dropping.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Liveness timeout after which a silent group member is evicted.
    pub session_timeout_ms: u64,

    /// Interval at which marked offsets are committed to the coordinator.
    pub commit_interval_ms: u64,

    /// Buffered messages per consumer.
    pub channel_buffer_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Kafka,
            brokers: Vec::new(),
            topic: "accesslog".to_string(),
            group_id: "accesslog-indexer".to_string(),
            partitions: 8,
            send_buffer: 4096,
            flush_frequency_ms: 500,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2000,
            session_timeout_ms: 10_000,
            commit_interval_ms: 1000,
            channel_buffer_size: 2048,
        }
    }
}

impl BrokerConfig {
    pub fn flush_frequency(&self) -> Duration {
        Duration::from_millis(self.flush_frequency_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}

/// Consumer group configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of workers started by one indexer process.
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// Search backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search backend base URLs, tried in order.
    pub endpoints: Vec<String>,

    /// Target index; defaults to the broker topic when unset.
    pub index: Option<String>,

    /// Flush when this many documents are buffered.
    pub bulk_actions: usize,

    /// Flush when buffered documents reach this many bytes.
    pub bulk_size: usize,

    /// Flush at least this often (seconds).
    pub flush_interval_secs: u64,

    /// Per-request timeout against the search backend.
    pub request_timeout_secs: u64,

    /// Attempts for a failed bulk call before the batch is dropped.
    pub max_retries: u32,

    /// Primary shards for a newly created index.
    pub shards: u32,

    /// Replicas for a newly created index.
    pub replicas: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:9200".to_string()],
            index: None,
            bulk_actions: 1000,
            bulk_size: 5 * 1024 * 1024, // 5MB
            flush_interval_secs: 5,
            request_timeout_secs: 10,
            max_retries: 3,
            shards: 1,
            replicas: 0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Index documents are written to.
    pub fn index_name(&self) -> &str {
        self.search.index.as_deref().unwrap_or(&self.broker.topic)
    }
}
