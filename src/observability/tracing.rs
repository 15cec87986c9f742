//! Distributed tracing support.
//!
//! # Responsibilities
//! - Extract W3C trace context from inbound request headers
//! - Start a child span of the remote parent, or a root span when there is none
//! - Inject the current span into outbound request headers
//!
//! # Design Decisions
//! - The provider is owned by the process and never registered globally;
//!   handlers receive a [`TracePropagator`] through their state
//! - Malformed or missing headers never fail a request
//! - Export failures stay inside the SDK batch processor

use std::borrow::Cow;
use std::sync::Arc;

use axum::http::HeaderMap;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{
    Span as _, SpanContext, SpanId, Status, TraceContextExt, TraceId, Tracer as _,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Span, Tracer, TracerProvider};
use opentelemetry_sdk::Resource;

use crate::config::TracingConfig;
use crate::observability::carrier::{HeaderExtractor, HeaderInjector};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to create OTLP exporter: {0}")]
    Exporter(String),
}

/// Owns the tracer provider for the lifetime of the process.
pub struct Telemetry {
    provider: TracerProvider,
    service_name: String,
}

impl Telemetry {
    /// Build the provider. An empty endpoint yields a provider with no exporter.
    ///
    /// Must be called from within a Tokio runtime when an endpoint is set.
    pub fn init(config: &TracingConfig) -> Result<Self, TelemetryError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let root_sampler = if config.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if config.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(config.sample_ratio)
        };

        let mut builder = TracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(root_sampler)))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource);

        if config.endpoint.is_empty() {
            tracing::info!("No tracing endpoint configured, spans will not be exported");
        } else {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(&config.endpoint)
                .build()
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
            builder = builder.with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio);
            tracing::info!(endpoint = %config.endpoint, "OTLP span exporter configured");
        }

        Ok(Self {
            provider: builder.build(),
            service_name: config.service_name.clone(),
        })
    }

    /// A provider that records spans locally and exports nothing.
    pub fn local(service_name: &str) -> Self {
        Self {
            provider: TracerProvider::builder().build(),
            service_name: service_name.to_string(),
        }
    }

    pub fn propagator(&self) -> TracePropagator {
        TracePropagator {
            tracer: self.provider.tracer(self.service_name.clone()),
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }

    /// Flush pending spans and stop the exporter.
    pub fn shutdown(self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::warn!(error = %e, "Tracer provider shutdown failed");
        }
    }
}

/// Starts request spans and carries their context across HTTP hops.
#[derive(Clone)]
pub struct TracePropagator {
    tracer: Tracer,
    propagator: Arc<TraceContextPropagator>,
}

impl TracePropagator {
    /// Start a span for an inbound request.
    ///
    /// A valid remote context yields a child span in the caller's trace;
    /// anything else starts a new trace.
    pub fn start_span(
        &self,
        headers: &HeaderMap,
        name: impl Into<Cow<'static, str>>,
    ) -> RequestSpan {
        let remote = self
            .propagator
            .extract_with_context(&Context::new(), &HeaderExtractor(headers));
        let has_parent = remote.span().span_context().is_valid();

        let span = if has_parent {
            self.tracer.start_with_context(name, &remote)
        } else {
            tracing::debug!("No valid inbound trace context, starting root span");
            self.tracer.start_with_context(name, &Context::new())
        };

        RequestSpan {
            span,
            has_parent,
            finished: false,
        }
    }

    /// Write the span's context into outbound headers.
    pub fn inject(&self, span: &RequestSpan, headers: &mut HeaderMap) {
        let cx = Context::new().with_remote_span_context(span.span_context().clone());
        self.propagator.inject_context(&cx, &mut HeaderInjector(headers));
    }
}

/// A span that ends exactly once: on [`RequestSpan::finish`] or on drop.
pub struct RequestSpan {
    span: Span,
    has_parent: bool,
    finished: bool,
}

impl RequestSpan {
    pub fn span_context(&self) -> &SpanContext {
        self.span.span_context()
    }

    pub fn trace_id(&self) -> TraceId {
        self.span_context().trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span_context().span_id()
    }

    /// True when no remote parent was found.
    pub fn is_root(&self) -> bool {
        !self.has_parent
    }

    pub fn set_tag(&mut self, key: &'static str, value: impl Into<Value>) {
        self.span.set_attribute(KeyValue::new(key, value));
    }

    pub fn log_event(&mut self, name: &'static str, attributes: Vec<KeyValue>) {
        self.span.add_event(name, attributes);
    }

    pub fn set_error(&mut self, description: impl Into<Cow<'static, str>>) {
        self.span.set_status(Status::error(description));
    }

    pub fn finish(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if !self.finished {
            self.finished = true;
            self.span.end();
        }
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        self.end();
    }
}
