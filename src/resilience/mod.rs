//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to broker / search backend:
//!     → fails with a transient error
//!     → backoff.rs (exponential delay + jitter)
//!     → retried until RetryPolicy::max_attempts, then the caller drops the work
//! ```
//!
//! # Design Decisions
//! - Only errors classified as transient are retried
//! - Jittered backoff prevents thundering herd
//! - Exhausted retries never propagate to the HTTP response

pub mod backoff;

pub use backoff::{calculate_backoff, RetryPolicy};
