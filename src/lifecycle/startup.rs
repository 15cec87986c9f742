//! Startup orchestration.
//!
//! # Responsibilities
//! - Start the edge service: producer task, then the HTTP listener
//! - Start the indexer: broker check, index provisioning, then the consumer group
//! - Tear both down in order once the shutdown signal fires
//!
//! # Design Decisions
//! - Fail fast: an unreachable broker or an unprovisionable index is fatal
//! - Listeners and consumers start last (work only when ready)

use tokio::net::TcpListener;

use crate::broker::{Broker, BrokerError};
use crate::config::{ConfigError, PipelineConfig};
use crate::consumer::{ConsumerGroup, WorkerReport, WorkerSettings};
use crate::http::{DownstreamError, EdgeServer};
use crate::index::{ensure_index, IndexSchema, SearchBackend, SearchError};
use crate::lifecycle::Shutdown;
use crate::observability::{TelemetryError, TracePropagator};
use crate::producer::{AccessLogProducer, PublisherStats};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    #[error("search backend: {0}")]
    Search(#[from] SearchError),
    #[error("telemetry: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("downstream: {0}")]
    Downstream(#[from] DownstreamError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the edge service on `listener` until `shutdown` fires.
///
/// The producer is closed after the server stops, so every event from a
/// request that was already accepted is still published.
pub async fn run_edge<Br: Broker>(
    config: &PipelineConfig,
    broker: &Br,
    propagator: TracePropagator,
    listener: TcpListener,
    shutdown: &Shutdown,
) -> Result<PublisherStats, StartupError> {
    let (producer, producer_handle) = AccessLogProducer::spawn(broker.publisher()?, &config.broker);

    let server = match EdgeServer::new(&config.service, propagator, producer) {
        Ok(server) => server,
        Err(e) => {
            producer_handle.close().await;
            return Err(e.into());
        }
    };
    let served = server.run(listener, shutdown.subscribe()).await;

    let stats = producer_handle.close().await;
    served?;
    Ok(stats)
}

/// Run the indexer until `shutdown` fires and every worker has drained.
pub async fn run_indexer<Br, B>(
    config: &PipelineConfig,
    broker: &Br,
    backend: B,
    shutdown: &Shutdown,
) -> Result<Vec<WorkerReport>, StartupError>
where
    Br: Broker,
    B: SearchBackend + Clone,
{
    broker.ping().await?;
    tracing::info!(brokers = ?config.broker.brokers, "Broker reachable");

    let index = config.index_name();
    ensure_index(&backend, index, &IndexSchema::from_config(&config.search)).await?;

    let settings = WorkerSettings::from_config(config);
    let reports =
        ConsumerGroup::run(config.consumer.workers, broker, backend, &settings, shutdown).await?;

    let indexed: u64 = reports.iter().map(|r| r.writer.indexed).sum();
    tracing::info!(workers = reports.len(), indexed, "Indexer stopped");
    Ok(reports)
}
