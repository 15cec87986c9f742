//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, histograms)
//!
//! Edge requests additionally:
//!     → tracing.rs (OpenTelemetry spans, W3C context in/out)
//!     → carrier.rs (HeaderMap <-> propagator glue)
//!
//! Consumers:
//!     → stdout (fmt subscriber)
//!     → Prometheus scrape endpoint
//!     → OTLP collector (optional)
//! ```
//!
//! # Design Decisions
//! - Metrics are cheap (atomic increments behind the `metrics` facade)
//! - Span export is optional; without an endpoint spans stay local

pub mod carrier;
pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::tracing::{RequestSpan, Telemetry, TelemetryError, TracePropagator};
