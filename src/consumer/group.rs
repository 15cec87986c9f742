//! Runs N workers of one consumer group inside a single process.

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::broker::{Broker, BrokerError};
use crate::consumer::worker::{ConsumerWorker, WorkerReport, WorkerSettings, WorkerState};
use crate::index::{BatchIndexWriter, SearchBackend};
use crate::lifecycle::Shutdown;

/// A spawned worker.
pub struct WorkerHandle {
    pub id: usize,
    pub member_id: String,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<WorkerReport>,
    writer: AbortHandle,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Stop the worker without draining, as a crash would: the open batch is
    /// lost, nothing is committed and the group is not left. The coordinator
    /// notices through the session timeout.
    pub fn kill(&self) {
        tracing::warn!(worker = self.id, member = %self.member_id, "Killing worker");
        self.writer.abort();
        self.task.abort();
    }
}

pub struct ConsumerGroup {
    workers: Vec<WorkerHandle>,
}

impl ConsumerGroup {
    /// Join `count` members to the group and start them.
    ///
    /// Every worker gets its own clone of `backend` and its own batch writer.
    /// All of them stop when `shutdown` is triggered.
    pub fn spawn<Br, B>(
        count: usize,
        broker: &Br,
        backend: B,
        settings: &WorkerSettings,
        shutdown: &Shutdown,
    ) -> Result<Self, BrokerError>
    where
        Br: Broker,
        B: SearchBackend + Clone,
    {
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let consumer = broker.join_group(&settings.group_id, &settings.topic)?;
            let writer = BatchIndexWriter::spawn(
                backend.clone(),
                settings.index.clone(),
                settings.limits,
                settings.index_retry,
            );
            let writer_task = writer.abort_handle();
            let worker = ConsumerWorker::new(
                id,
                consumer,
                writer,
                settings.commit_interval,
                shutdown.subscribe(),
            );
            let member_id = worker.member_id().to_string();
            let state = worker.state();
            workers.push(WorkerHandle {
                id,
                member_id,
                state,
                task: tokio::spawn(worker.run()),
                writer: writer_task,
            });
        }

        tracing::info!(
            group = %settings.group_id,
            topic = %settings.topic,
            workers = count,
            "Consumer group started"
        );
        Ok(Self { workers })
    }

    /// Spawn the group and wait until every worker has closed.
    pub async fn run<Br, B>(
        count: usize,
        broker: &Br,
        backend: B,
        settings: &WorkerSettings,
        shutdown: &Shutdown,
    ) -> Result<Vec<WorkerReport>, BrokerError>
    where
        Br: Broker,
        B: SearchBackend + Clone,
    {
        Ok(Self::spawn(count, broker, backend, settings, shutdown)?.join().await)
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Wait for every worker. Killed workers report nothing.
    pub async fn join(self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            match worker.task.await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(worker = worker.id, "Worker was killed");
                }
                Err(e) => tracing::error!(worker = worker.id, error = %e, "Worker task failed"),
            }
        }
        reports
    }
}
