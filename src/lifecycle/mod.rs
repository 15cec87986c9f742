//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Connect broker → Ensure index → Start workers
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop pulling/accepting → Drain (final commit + flush) → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: fatal errors (broker, index) abort before any work starts
//! - Ordered shutdown: broker session, then batch writer, then search backend

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
