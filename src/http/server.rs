//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router; every path and method hits the access-log handler
//! - Wire up middleware (timeout, request ID, tower-http tracing)
//! - Serve with connect info so handlers see the client address
//! - Stop accepting on shutdown and let in-flight requests finish

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::any, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServiceConfig;
use crate::http::downstream::{Downstream, DownstreamError};
use crate::http::handler::access_log_handler;
use crate::lifecycle::ShutdownSignal;
use crate::observability::TracePropagator;
use crate::producer::AccessLogProducer;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub propagator: TracePropagator,
    pub producer: AccessLogProducer,
    pub downstream: Option<Arc<Downstream>>,
    pub message_len: usize,
}

/// The instrumented edge service.
pub struct EdgeServer {
    router: Router,
}

impl EdgeServer {
    pub fn new(
        config: &ServiceConfig,
        propagator: TracePropagator,
        producer: AccessLogProducer,
    ) -> Result<Self, DownstreamError> {
        let request_timeout = config.request_timeout();
        let downstream = config
            .downstream_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| {
                Downstream::new(
                    url,
                    config.max_idle_conns_per_host,
                    config.downstream_timeout(),
                )
            })
            .transpose()?
            .map(Arc::new);

        let state = AppState {
            propagator,
            producer,
            downstream,
            message_len: config.message_len,
        };

        Ok(Self {
            router: Self::build_router(request_timeout, state),
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(request_timeout: Duration, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(access_log_handler))
            .route("/", any(access_log_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(TimeoutLayer::new(request_timeout)),
            )
    }

    /// Serve until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
