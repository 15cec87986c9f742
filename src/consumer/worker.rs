//! One group member: pull, decode, hand off to the batch writer, mark.
//!
//! # State machine
//! ```text
//! Joining → Assigned → Running → (Rebalancing → Assigned → Running)* → Draining → Closed
//! ```
//!
//! An offset is marked only once the batch holding its document has been
//! written, and marks are committed on a timer. A worker that dies before a
//! flush or before the next commit has those messages redelivered to whoever
//! takes over the partition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::broker::{BrokerMessage, ConsumerEvent, GroupConsumer, PartitionId, RebalanceEvent};
use crate::config::PipelineConfig;
use crate::event::AccessLogEvent;
use crate::index::{BatchIndexWriter, BatchLimits, IndexDocument, WriterStatsSnapshot};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::resilience::RetryPolicy;

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Joining,
    Assigned(Vec<PartitionId>),
    Running,
    Rebalancing,
    Draining,
    Closed,
}

/// Everything a worker needs besides its broker session and backend.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub group_id: String,
    pub topic: String,
    pub index: String,
    pub limits: BatchLimits,
    pub index_retry: RetryPolicy,
    pub commit_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            group_id: config.broker.group_id.clone(),
            topic: config.broker.topic.clone(),
            index: config.index_name().to_string(),
            limits: BatchLimits::from_config(&config.search),
            index_retry: RetryPolicy::new(
                config.search.max_retries + 1,
                config.broker.retry_base_delay_ms,
                config.broker.retry_max_delay_ms,
            ),
            commit_interval: config.broker.commit_interval(),
        }
    }
}

/// Totals reported when a worker closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub member_id: String,
    pub consumed: u64,
    pub decode_failures: u64,
    pub rebalances: u64,
    pub writer: WriterStatsSnapshot,
}

pub struct ConsumerWorker<C> {
    id: usize,
    consumer: C,
    writer: BatchIndexWriter,
    commit_interval: Duration,
    state: Arc<watch::Sender<WorkerState>>,
    shutdown: ShutdownSignal,
    report: WorkerReport,
    /// Messages waiting for their document to be written, tagged with the
    /// writer count that settles them.
    pending: VecDeque<(u64, BrokerMessage)>,
    handed_off: u64,
}

impl<C: GroupConsumer> ConsumerWorker<C> {
    pub fn new(
        id: usize,
        mut consumer: C,
        writer: BatchIndexWriter,
        commit_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Joining);
        let state = Arc::new(state);

        let on_rebalance = state.clone();
        let member_id = consumer.member_id().to_string();
        consumer.on_rebalance(Arc::new(move |event: &RebalanceEvent| {
            on_rebalance.send_replace(WorkerState::Rebalancing);
            metrics::record_rebalance();
            tracing::info!(
                worker = id,
                generation = event.generation,
                assigned = ?event.assigned,
                revoked = ?event.revoked,
                "Partitions rebalanced"
            );
        }));

        Self {
            id,
            report: WorkerReport {
                worker: id,
                member_id,
                ..WorkerReport::default()
            },
            consumer,
            writer,
            commit_interval,
            state,
            shutdown,
            pending: VecDeque::new(),
            handed_off: 0,
        }
    }

    /// Watch this worker's state transitions.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn member_id(&self) -> &str {
        self.consumer.member_id()
    }

    fn set_state(&self, state: WorkerState) {
        tracing::debug!(worker = self.id, state = ?state, "Worker state");
        self.state.send_replace(state);
    }

    /// Consume until shutdown, then drain.
    pub async fn run(mut self) -> WorkerReport {
        tracing::info!(worker = self.id, member = %self.consumer.member_id(), "Worker started");

        let mut commit_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.commit_interval,
            self.commit_interval,
        );
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                _ = commit_ticker.tick() => self.commit().await,
                event = self.consumer.pull() => self.handle(event).await,
            }
        }

        self.drain().await
    }

    async fn handle(&mut self, event: ConsumerEvent) {
        match event {
            ConsumerEvent::Message(message) => self.process(message).await,
            ConsumerEvent::Rebalanced(event) => {
                self.report.rebalances += 1;
                let partitions = self.consumer.assigned_partitions();
                self.pending
                    .retain(|(_, message)| partitions.contains(&message.partition));
                if partitions.is_empty() {
                    tracing::info!(worker = self.id, generation = event.generation, "No partitions assigned");
                }
                self.set_state(WorkerState::Assigned(partitions));
                self.set_state(WorkerState::Running);
            }
            ConsumerEvent::Error(e) => {
                metrics::record_consumer_error();
                tracing::warn!(worker = self.id, error = %e, "Consumer error");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    async fn process(&mut self, message: BrokerMessage) {
        self.report.consumed += 1;
        metrics::record_message_consumed(message.partition);

        let document = match AccessLogEvent::decode(&message.payload)
            .and_then(|event| IndexDocument::from_event(&event))
        {
            Ok(document) => Some(document),
            Err(e) => {
                self.report.decode_failures += 1;
                metrics::record_event_dropped("decode");
                tracing::warn!(
                    worker = self.id,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping undecodable message"
                );
                None
            }
        };

        if let Some(document) = document {
            if let Err(e) = self.writer.add(document).await {
                // Never marked, so the message is redelivered.
                tracing::error!(worker = self.id, error = %e, "Batch writer unavailable");
                return;
            }
            self.handed_off += 1;
        }

        self.pending.push_back((self.handed_off, message));
    }

    /// Mark every message whose document the writer has settled.
    fn mark_written(&mut self) {
        let completed = self.writer.completed();
        while self.pending.front().is_some_and(|(needed, _)| *needed <= completed) {
            let Some((_, message)) = self.pending.pop_front() else {
                break;
            };
            if let Err(e) = self.consumer.mark_offset(&message) {
                tracing::debug!(
                    worker = self.id,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Could not mark offset"
                );
            }
        }
    }

    async fn commit(&mut self) {
        self.mark_written();
        if let Err(e) = self.consumer.commit().await {
            metrics::record_consumer_error();
            tracing::warn!(worker = self.id, error = %e, "Offset commit failed");
        }
    }

    async fn drain(mut self) -> WorkerReport {
        self.set_state(WorkerState::Draining);
        if let Err(e) = self.writer.flush().await {
            tracing::warn!(worker = self.id, error = %e, "Final flush failed");
        }
        self.mark_written();
        if !self.pending.is_empty() {
            tracing::warn!(worker = self.id, unmarked = self.pending.len(), "Leaving offsets for redelivery");
        }

        let ConsumerWorker {
            id,
            consumer,
            writer,
            state,
            mut report,
            ..
        } = self;

        if let Err(e) = consumer.close().await {
            tracing::warn!(worker = id, error = %e, "Broker session did not close cleanly");
        }
        report.writer = writer.close().await;

        state.send_replace(WorkerState::Closed);
        tracing::info!(
            worker = id,
            consumed = report.consumed,
            indexed = report.writer.indexed,
            "Worker closed"
        );
        report
    }
}
