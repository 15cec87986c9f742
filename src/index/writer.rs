//! Background batching writer.
//!
//! Callers hand documents to a bounded queue. A single flush loop owns the
//! open batch and sends it as one bulk request when it reaches the count or
//! byte threshold, or when the flush interval has elapsed since the last
//! flush. Any flush restarts the interval, so triggers never stack.
//!
//! Batches are written in the order documents were added. `completed()`
//! counts documents whose batch has finished (indexed, rejected or dropped),
//! so the first `completed()` documents handed to `add` are settled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::index::backend::{IndexDocument, SearchBackend, SearchError};
use crate::index::batch::{BatchLimits, FlushTrigger, IndexBatch};
use crate::observability::metrics;
use crate::resilience::RetryPolicy;

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WriterError {
    #[error("batch writer is closed")]
    Closed,
}

/// Running totals for one writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    flushes: AtomicU64,
    indexed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatsSnapshot {
    pub flushes: u64,
    pub indexed: u64,
    pub rejected: u64,
    pub dropped: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Add(IndexDocument),
    Flush(oneshot::Sender<()>),
}

/// Handle to a running flush loop.
pub struct BatchIndexWriter {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    stats: Arc<WriterStats>,
}

impl BatchIndexWriter {
    pub fn spawn<B: SearchBackend>(
        backend: B,
        index: impl Into<String>,
        limits: BatchLimits,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let stats = Arc::new(WriterStats::default());
        let flush_loop = FlushLoop {
            sink: BulkSink {
                backend,
                index: index.into(),
                retry,
                stats: stats.clone(),
            },
            limits,
            rx,
        };
        let task = tokio::spawn(flush_loop.run());
        Self { tx, task, stats }
    }

    /// Queue a document for the next batch.
    pub async fn add(&self, document: IndexDocument) -> Result<(), WriterError> {
        self.tx
            .send(Command::Add(document))
            .await
            .map_err(|_| WriterError::Closed)
    }

    /// Send whatever is batched now and wait for the write to finish.
    pub async fn flush(&self) -> Result<(), WriterError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| WriterError::Closed)?;
        done.await.map_err(|_| WriterError::Closed)
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of added documents whose batch has finished.
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Acquire)
    }

    /// Lets a supervisor stop the flush loop without flushing.
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Flush everything still queued and stop the loop.
    pub async fn close(self) -> WriterStatsSnapshot {
        drop(self.tx);
        match self.task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => tracing::debug!("Batch writer was aborted"),
            Err(e) => tracing::error!(error = %e, "Batch writer task failed"),
        }
        self.stats.snapshot()
    }
}

struct FlushLoop<B> {
    sink: BulkSink<B>,
    limits: BatchLimits,
    rx: mpsc::Receiver<Command>,
}

impl<B: SearchBackend> FlushLoop<B> {
    async fn run(mut self) {
        let mut batch = IndexBatch::new();
        let mut deadline = tokio::time::Instant::now() + self.limits.flush_interval;

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Add(document)) => {
                        batch.push(document);
                        if let Some(trigger) = batch.is_full(&self.limits) {
                            self.sink.flush(&mut batch, trigger).await;
                            deadline = tokio::time::Instant::now() + self.limits.flush_interval;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        self.sink.flush(&mut batch, FlushTrigger::Manual).await;
                        deadline = tokio::time::Instant::now() + self.limits.flush_interval;
                        let _ = reply.send(());
                    }
                    None => {
                        self.sink.flush(&mut batch, FlushTrigger::Close).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.sink.flush(&mut batch, FlushTrigger::Interval).await;
                    deadline = tokio::time::Instant::now() + self.limits.flush_interval;
                }
            }
        }

        tracing::debug!(index = %self.sink.index, "Batch writer stopped");
    }
}

/// Sends batches to the backend and accounts for the outcome.
struct BulkSink<B> {
    backend: B,
    index: String,
    retry: RetryPolicy,
    stats: Arc<WriterStats>,
}

impl<B: SearchBackend> BulkSink<B> {
    async fn flush(&self, batch: &mut IndexBatch, trigger: FlushTrigger) {
        if batch.is_empty() {
            return;
        }
        let bytes = batch.size_bytes();
        let documents = batch.take();
        let start = Instant::now();

        let result = self
            .retry
            .run(
                |attempt| {
                    if attempt > 1 {
                        tracing::debug!(index = %self.index, attempt, "Retrying bulk write");
                    }
                    self.backend.bulk(&self.index, &documents)
                },
                |e: &SearchError| e.is_transient(),
            )
            .await;

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::record_bulk_flush(trigger.as_str(), start.elapsed());
        self.stats
            .completed
            .fetch_add(documents.len() as u64, Ordering::Release);

        match result {
            Ok(outcome) => {
                for failure in &outcome.failures {
                    tracing::warn!(
                        index = %self.index,
                        id = %failure.id,
                        status = failure.status,
                        reason = %failure.reason,
                        "Document rejected by search backend"
                    );
                }
                self.stats.indexed.fetch_add(outcome.indexed as u64, Ordering::Relaxed);
                self.stats
                    .rejected
                    .fetch_add(outcome.failures.len() as u64, Ordering::Relaxed);
                metrics::record_documents_indexed(outcome.indexed);
                metrics::record_documents_rejected(outcome.failures.len());

                tracing::debug!(
                    index = %self.index,
                    trigger = trigger.as_str(),
                    documents = documents.len(),
                    bytes,
                    indexed = outcome.indexed,
                    rejected = outcome.failures.len(),
                    elapsed = ?start.elapsed(),
                    "Flushed batch"
                );
            }
            Err((e, attempts)) => {
                self.stats
                    .dropped
                    .fetch_add(documents.len() as u64, Ordering::Relaxed);
                for _ in 0..documents.len() {
                    metrics::record_event_dropped("index_failed");
                }
                tracing::error!(
                    index = %self.index,
                    trigger = trigger.as_str(),
                    documents = documents.len(),
                    attempts,
                    error = %e,
                    "Bulk write failed, dropping batch"
                );
            }
        }
    }
}
