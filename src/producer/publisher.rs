//! Background task that moves queued records to the broker.
//!
//! Records with different keys are published concurrently. Records sharing a
//! key go out one at a time, in queue order, so a retried record is never
//! overtaken by the ones behind it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::broker::{BrokerError, ProducerRecord, Publish};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::resilience::RetryPolicy;

/// What happened to the records that went through one publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
}

pub struct Publisher<P> {
    pub(crate) publisher: P,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_in_flight: usize,
    pub(crate) flush_timeout: Duration,
}

type SendResult = (String, Result<(), (BrokerError, u32)>);

async fn send_one<P: Publish>(
    publisher: &P,
    retry: RetryPolicy,
    record: ProducerRecord,
) -> SendResult {
    let key = record.key.clone();
    let result = retry
        .run(
            |_| publisher.publish(record.clone()),
            |e: &BrokerError| e.is_transient(),
        )
        .await;
    (key, result)
}

/// Records parked behind the in-flight record of the same key.
///
/// A key is present exactly while one of its records is in flight.
#[derive(Default)]
struct KeyQueues {
    waiting: HashMap<String, VecDeque<ProducerRecord>>,
    held: usize,
}

impl KeyQueues {
    /// Admit `record`. Returns it back when its key is idle and it can go now.
    fn admit(&mut self, record: ProducerRecord) -> Option<ProducerRecord> {
        self.held += 1;
        match self.waiting.get_mut(&record.key) {
            Some(queue) => {
                queue.push_back(record);
                None
            }
            None => {
                self.waiting.insert(record.key.clone(), VecDeque::new());
                Some(record)
            }
        }
    }

    /// The in-flight record for `key` finished. Returns the next one to send.
    fn complete(&mut self, key: &str) -> Option<ProducerRecord> {
        self.held = self.held.saturating_sub(1);
        let next = self.waiting.get_mut(key).and_then(VecDeque::pop_front);
        if next.is_none() {
            self.waiting.remove(key);
        }
        next
    }
}

impl<P: Publish> Publisher<P> {
    /// Publish until `closing` fires, then drain what was already queued.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<ProducerRecord>,
        mut closing: ShutdownSignal,
    ) -> PublisherStats {
        let Publisher {
            publisher,
            retry,
            max_in_flight,
            flush_timeout,
        } = self;
        let mut stats = PublisherStats::default();
        let mut in_flight = FuturesUnordered::new();
        let mut queues = KeyQueues::default();
        let mut draining = false;

        loop {
            tokio::select! {
                _ = closing.recv(), if !draining => {
                    tracing::debug!("Producer closing, draining queue");
                    rx.close();
                    draining = true;
                }
                record = rx.recv(), if queues.held < max_in_flight => match record {
                    Some(record) => {
                        if let Some(record) = queues.admit(record) {
                            in_flight.push(send_one(&publisher, retry, record));
                        }
                    }
                    None => break,
                },
                result = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some((key, result)) = result {
                        account(&mut stats, &key, result);
                        if let Some(next) = queues.complete(&key) {
                            in_flight.push(send_one(&publisher, retry, next));
                        }
                    }
                }
            }
        }

        while let Some((key, result)) = in_flight.next().await {
            account(&mut stats, &key, result);
            if let Some(next) = queues.complete(&key) {
                in_flight.push(send_one(&publisher, retry, next));
            }
        }

        if let Err(e) = publisher.flush(flush_timeout).await {
            tracing::warn!(error = %e, "Broker flush on close failed");
        }

        tracing::info!(
            published = stats.published,
            failed = stats.failed,
            "Producer stopped"
        );
        stats
    }
}

fn account(stats: &mut PublisherStats, key: &str, result: Result<(), (BrokerError, u32)>) {
    match result {
        Ok(()) => {
            stats.published += 1;
            metrics::record_event_produced();
        }
        Err((e, attempts)) => {
            stats.failed += 1;
            metrics::record_event_dropped("send_failed");
            tracing::error!(key = %key, attempts, error = %e, "Dropping event after failed send");
        }
    }
}
