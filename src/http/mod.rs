//! HTTP boundary of the edge service.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, timeout)
//!     → handler.rs (start span, optional downstream call, build event)
//!     → downstream.rs (GET with traceparent injected)
//!     → producer::AccessLogProducer (fire-and-forget)
//!     → 200 "hello, world!"
//! ```

pub mod downstream;
pub mod handler;
pub mod server;

pub use downstream::{Downstream, DownstreamError};
pub use server::{AppState, EdgeServer};
