//! Access-log pipeline
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──▶ edge service (serve) ──▶ downstream (optional, traceparent injected)
//!                   │
//!                   │ AccessLogEvent, key = client IP
//!                   ▼
//!            ┌──────────────┐
//!            │ log broker   │  topic partitions
//!            └──────┬───────┘
//!                   │ consumer group (index)
//!          ┌────────┼────────┐
//!          ▼        ▼        ▼
//!       worker   worker   worker ──▶ batch writer ──▶ search backend (_bulk)
//! ```
//!
//! `standalone` runs both halves in one process, which is the only useful way
//! to run with the in-memory broker.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use accesslog_pipeline::broker::{Broker, KafkaBroker, MemoryBroker};
use accesslog_pipeline::config::validation::validate_config;
use accesslog_pipeline::config::{load_config, BrokerKind, ConfigError, PipelineConfig};
use accesslog_pipeline::index::ElasticsearchBackend;
use accesslog_pipeline::lifecycle::signals::trigger_on_signal;
use accesslog_pipeline::lifecycle::startup::{run_edge, run_indexer, StartupError};
use accesslog_pipeline::lifecycle::Shutdown;
use accesslog_pipeline::observability::{logging, metrics, Telemetry};

#[derive(Parser)]
#[command(name = "accesslog-pipeline", version)]
#[command(about = "Trace-aware access-log pipeline: edge service and indexer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the instrumented edge service
    Serve {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Listen address, overrides service.bind_address
        #[arg(long)]
        addr: Option<String>,
        /// Downstream called on every request; must start with http://
        #[arg(long)]
        downstream: Option<String>,
    },
    /// Run the consumer-group indexer
    Index {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the edge service and the indexer in one process
    Standalone {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        downstream: Option<String>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Edge,
    Indexer,
    Both,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let (role, config) = match cli.command {
        Command::Serve {
            config,
            addr,
            downstream,
        } => (Role::Edge, load(&config, addr, downstream)?),
        Command::Index { config } => (Role::Indexer, load(&config, None, None)?),
        Command::Standalone {
            config,
            addr,
            downstream,
        } => (Role::Both, load(&config, addr, downstream)?),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "accesslog-pipeline starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    trigger_on_signal(shutdown.clone());

    match config.broker.kind {
        BrokerKind::Kafka => {
            let broker = KafkaBroker::new(config.broker.clone())?;
            run(role, &config, &broker, &shutdown).await?;
        }
        BrokerKind::Memory => {
            if role != Role::Both {
                tracing::warn!("In-memory broker is not shared between processes; use `standalone`");
            }
            let broker = MemoryBroker::new(config.broker.partitions, config.broker.session_timeout());
            run(role, &config, &broker, &shutdown).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Load the config file, apply command-line overrides, and validate.
fn load(
    path: &Path,
    addr: Option<String>,
    downstream: Option<String>,
) -> Result<PipelineConfig, ConfigError> {
    let mut config = load_config(path)?;
    if let Some(addr) = addr {
        config.service.bind_address = addr;
    }
    if let Some(downstream) = downstream {
        config.service.downstream_url = Some(downstream);
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

async fn run<Br: Broker>(
    role: Role,
    config: &PipelineConfig,
    broker: &Br,
    shutdown: &Shutdown,
) -> Result<(), StartupError> {
    let edge = async {
        if role == Role::Indexer {
            return Ok::<(), StartupError>(());
        }
        let telemetry = Telemetry::init(&config.tracing)?;
        let result = async {
            let listener = TcpListener::bind(&config.service.bind_address).await?;
            run_edge(config, broker, telemetry.propagator(), listener, shutdown).await
        }
        .await;
        telemetry.shutdown();
        shutdown.trigger();

        let stats = result?;
        tracing::info!(published = stats.published, failed = stats.failed, "Edge service stopped");
        Ok(())
    };

    let indexer = async {
        if role == Role::Edge {
            return Ok::<(), StartupError>(());
        }
        let result = match ElasticsearchBackend::new(&config.search) {
            Ok(backend) => run_indexer(config, broker, backend, shutdown).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        shutdown.trigger();
        result
    };

    let (edge, indexer) = tokio::join!(edge, indexer);
    edge.and(indexer)
}
