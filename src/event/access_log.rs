//! The access-log event and its wire encoding.
//!
//! One event is produced per completed request at the edge and decoded again
//! by the indexer. Events are immutable; the JSON encoding is computed at most
//! once and shared between logging, size accounting and transmission.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors produced while encoding or decoding events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode access log event: {0}")]
    Encode(String),
    #[error("malformed access log payload: {0}")]
    Decode(String),
}

/// A single completed request as seen by the edge service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEvent {
    timestamp: DateTime<Utc>,
    method: String,
    host: String,
    path: String,
    ip: String,
    /// Seconds spent handling the request.
    response_time: f64,
    traceno: Uuid,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    span_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, String>,

    #[serde(skip)]
    encoded: OnceLock<Result<Bytes, CodecError>>,
}

impl AccessLogEvent {
    /// Start building an event. Timestamp and trace number default to now / a fresh UUID.
    pub fn builder() -> AccessLogEventBuilder {
        AccessLogEventBuilder::default()
    }

    /// Decode an event from its wire form.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// The wire form of this event, computed on first use.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        self.encoded
            .get_or_init(|| {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| CodecError::Encode(e.to_string()))
            })
            .clone()
    }

    /// Size of the wire form in bytes (0 if the event cannot be encoded).
    pub fn encoded_len(&self) -> usize {
        self.encode().map(|b| b.len()).unwrap_or(0)
    }

    /// Stable identity used as the document id, so re-indexing is an upsert.
    pub fn document_id(&self) -> String {
        self.traceno.to_string()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn response_time(&self) -> f64 {
        self.response_time
    }

    pub fn traceno(&self) -> Uuid {
        self.traceno
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

impl PartialEq for AccessLogEvent {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.method == other.method
            && self.host == other.host
            && self.path == other.path
            && self.ip == other.ip
            && self.response_time == other.response_time
            && self.traceno == other.traceno
            && self.message == other.message
            && self.trace_id == other.trace_id
            && self.span_id == other.span_id
            && self.tags == other.tags
    }
}

/// Builder for [`AccessLogEvent`].
#[derive(Debug, Default)]
pub struct AccessLogEventBuilder {
    timestamp: Option<DateTime<Utc>>,
    method: String,
    host: String,
    path: String,
    ip: String,
    response_time: f64,
    traceno: Option<Uuid>,
    message: String,
    trace_id: Option<String>,
    span_id: Option<String>,
    tags: BTreeMap<String, String>,
}

impl AccessLogEventBuilder {
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn response_time(mut self, elapsed: Duration) -> Self {
        self.response_time = elapsed.as_secs_f64();
        self
    }

    pub fn traceno(mut self, traceno: Uuid) -> Self {
        self.traceno = Some(traceno);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Correlate the event with the distributed trace it belongs to.
    pub fn trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        AccessLogEvent {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            method: self.method,
            host: self.host,
            path: self.path,
            ip: self.ip,
            response_time: self.response_time,
            traceno: self.traceno.unwrap_or_else(Uuid::new_v4),
            message: self.message,
            trace_id: self.trace_id,
            span_id: self.span_id,
            tags: self.tags,
            encoded: OnceLock::new(),
        }
    }
}
