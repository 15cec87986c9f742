//! Configuration validation.
//!
//! Semantic checks only; serde already handled syntax. All problems are
//! collected so an operator can fix a config file in one pass.

use std::net::SocketAddr;

use crate::config::schema::{BrokerKind, PipelineConfig};

/// A single semantic problem in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &PipelineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.service.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "service.bind_address",
            format!("'{}' is not a socket address", config.service.bind_address),
        ));
    }

    if let Some(downstream) = &config.service.downstream_url {
        if !downstream.starts_with("http://") {
            errors.push(ValidationError::new(
                "service.downstream_url",
                "downstream must be prefixed with the 'http://' scheme",
            ));
        } else if url::Url::parse(downstream).is_err() {
            errors.push(ValidationError::new(
                "service.downstream_url",
                format!("'{}' is not a valid URL", downstream),
            ));
        }
    }

    if config.service.request_timeout_secs == 0 {
        errors.push(ValidationError::new("service.request_timeout_secs", "must be > 0"));
    } else if config.service.downstream_timeout_ms == 0
        || config.service.downstream_timeout_ms >= config.service.request_timeout_secs * 1000
    {
        errors.push(ValidationError::new(
            "service.downstream_timeout_ms",
            "must be > 0 and below service.request_timeout_secs",
        ));
    }

    if !config.tracing.endpoint.is_empty() && url::Url::parse(&config.tracing.endpoint).is_err() {
        errors.push(ValidationError::new(
            "tracing.endpoint",
            format!("'{}' is not a valid URL", config.tracing.endpoint),
        ));
    }

    if config.tracing.service_name.is_empty() {
        errors.push(ValidationError::new("tracing.service_name", "must not be empty"));
    }

    if !(0.0..=1.0).contains(&config.tracing.sample_ratio) {
        errors.push(ValidationError::new("tracing.sample_ratio", "must be within 0.0..=1.0"));
    }

    if config.broker.kind == BrokerKind::Kafka && config.broker.brokers.is_empty() {
        errors.push(ValidationError::new("broker.brokers", "at least one broker must be configured"));
    }

    if config.broker.topic.is_empty() {
        errors.push(ValidationError::new("broker.topic", "must not be empty"));
    }

    if config.broker.group_id.is_empty() {
        errors.push(ValidationError::new("broker.group_id", "must not be empty"));
    }

    if config.broker.partitions == 0 {
        errors.push(ValidationError::new("broker.partitions", "must be > 0"));
    }

    if config.broker.send_buffer == 0 {
        errors.push(ValidationError::new("broker.send_buffer", "must be > 0"));
    }

    if config.broker.max_retries == 0 {
        errors.push(ValidationError::new("broker.max_retries", "must be > 0"));
    }

    if config.broker.session_timeout_ms == 0 {
        errors.push(ValidationError::new("broker.session_timeout_ms", "must be > 0"));
    }

    if config.broker.commit_interval_ms == 0 {
        errors.push(ValidationError::new("broker.commit_interval_ms", "must be > 0"));
    }

    if config.consumer.workers == 0 {
        errors.push(ValidationError::new("consumer.workers", "must be > 0"));
    }

    if config.search.endpoints.is_empty() {
        errors.push(ValidationError::new("search.endpoints", "at least one endpoint must be configured"));
    }
    for endpoint in &config.search.endpoints {
        if url::Url::parse(endpoint).is_err() {
            errors.push(ValidationError::new(
                "search.endpoints",
                format!("'{}' is not a valid URL", endpoint),
            ));
        }
    }

    if config.search.bulk_actions == 0 {
        errors.push(ValidationError::new("search.bulk_actions", "must be > 0"));
    }

    if config.search.bulk_size == 0 {
        errors.push(ValidationError::new("search.bulk_size", "must be > 0"));
    }

    if config.search.flush_interval_secs == 0 {
        errors.push(ValidationError::new("search.flush_interval_secs", "must be > 0"));
    }

    if config.search.max_retries == 0 {
        errors.push(ValidationError::new("search.max_retries", "must be > 0"));
    }

    if config.search.shards == 0 {
        errors.push(ValidationError::new("search.shards", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
