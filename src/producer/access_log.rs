//! Fire-and-forget producer handle used by the edge handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::broker::{ProducerRecord, Publish};
use crate::config::BrokerConfig;
use crate::event::AccessLogEvent;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::producer::publisher::{Publisher, PublisherStats};
use crate::resilience::RetryPolicy;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap to clone; every clone feeds the same publisher task.
#[derive(Clone)]
pub struct AccessLogProducer {
    tx: mpsc::Sender<ProducerRecord>,
    topic: Arc<str>,
}

/// Owns the publisher task. Closing it drains the queue and flushes the broker.
pub struct ProducerHandle {
    closing: Shutdown,
    task: JoinHandle<PublisherStats>,
}

impl AccessLogProducer {
    pub fn spawn<P: Publish>(publisher: P, config: &BrokerConfig) -> (Self, ProducerHandle) {
        let (tx, rx) = mpsc::channel(config.send_buffer.max(1));
        let closing = Shutdown::new();
        let task = Publisher {
            publisher,
            retry: RetryPolicy::new(
                config.max_retries + 1,
                config.retry_base_delay_ms,
                config.retry_max_delay_ms,
            ),
            max_in_flight: config.channel_buffer_size.max(1),
            flush_timeout: FLUSH_TIMEOUT,
        }
        .run(rx, closing.subscribe());

        let producer = Self {
            tx,
            topic: Arc::from(config.topic.as_str()),
        };
        let handle = ProducerHandle {
            closing,
            task: tokio::spawn(task),
        };
        (producer, handle)
    }

    /// Queue `event` for the partition chosen by `key`. Never waits.
    ///
    /// Returns false when the event was dropped.
    pub fn produce(&self, event: &AccessLogEvent, key: &str) -> bool {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                metrics::record_event_dropped("encode");
                tracing::warn!(traceno = %event.traceno(), error = %e, "Dropping unencodable event");
                return false;
            }
        };

        let record = ProducerRecord {
            topic: self.topic.to_string(),
            key: key.to_string(),
            payload,
        };

        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::record_event_dropped("queue_full");
                tracing::warn!(traceno = %event.traceno(), "Producer queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics::record_event_dropped("closed");
                tracing::debug!(traceno = %event.traceno(), "Producer closed, dropping event");
                false
            }
        }
    }
}

impl ProducerHandle {
    /// Stop admission, publish everything already queued, flush, and join.
    pub async fn close(self) -> PublisherStats {
        self.closing.trigger();
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Producer task failed");
                PublisherStats::default()
            }
        }
    }
}
