//! Metrics collection and exposition.
//!
//! # Metrics
//! - `accesslog_requests_total` (counter): edge requests by method, status
//! - `accesslog_request_duration_seconds` (histogram): edge latency
//! - `accesslog_events_produced_total` (counter): events accepted by the broker
//! - `accesslog_events_dropped_total` (counter): events dropped, by reason
//! - `accesslog_messages_consumed_total` (counter): messages pulled, by partition
//! - `accesslog_consumer_errors_total` (counter): non-fatal broker errors
//! - `accesslog_rebalances_total` (counter): partition reassignments seen
//! - `accesslog_bulk_flushes_total` (counter): bulk writes, by trigger
//! - `accesslog_bulk_flush_duration_seconds` (histogram)
//! - `accesslog_documents_indexed_total` / `accesslog_documents_rejected_total`

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics exporter started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "accesslog_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("accesslog_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_event_produced() {
    counter!("accesslog_events_produced_total").increment(1);
}

/// Reasons: `queue_full`, `closed`, `encode`, `send_failed`, `decode`, `index_failed`.
pub fn record_event_dropped(reason: &'static str) {
    counter!("accesslog_events_dropped_total", "reason" => reason).increment(1);
}

pub fn record_message_consumed(partition: u32) {
    counter!("accesslog_messages_consumed_total", "partition" => partition.to_string()).increment(1);
}

pub fn record_consumer_error() {
    counter!("accesslog_consumer_errors_total").increment(1);
}

pub fn record_rebalance() {
    counter!("accesslog_rebalances_total").increment(1);
}

/// Triggers: `count`, `bytes`, `interval`, `manual`, `close`.
pub fn record_bulk_flush(trigger: &'static str, elapsed: Duration) {
    counter!("accesslog_bulk_flushes_total", "trigger" => trigger).increment(1);
    histogram!("accesslog_bulk_flush_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_documents_indexed(count: usize) {
    counter!("accesslog_documents_indexed_total").increment(count as u64);
}

pub fn record_documents_rejected(count: usize) {
    counter!("accesslog_documents_rejected_total").increment(count as u64);
}
