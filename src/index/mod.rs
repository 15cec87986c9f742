//! Search index subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     provisioner.rs (ensure_index: exists? → create → "already exists" is fine)
//!
//! Steady state:
//!     AccessLogEvent → IndexDocument (_id = traceno)
//!         → writer.rs (bounded queue → flush loop owns batch.rs)
//!         → count | bytes | interval trigger
//!         → SearchBackend::bulk (retried while transient)
//!
//! Backends:
//!     elasticsearch.rs (REST, endpoint failover)
//!     memory.rs (in-process, used by tests)
//! ```
//!
//! # Design Decisions
//! - Document ids are trace numbers, so redelivered events overwrite instead of duplicating
//! - Rejected documents are logged and dropped; only whole-request failures are retried

pub mod backend;
pub mod batch;
pub mod elasticsearch;
pub mod memory;
pub mod provisioner;
pub mod schema;
pub mod writer;

pub use backend::{
    BulkFailure, BulkOutcome, IndexDocument, SearchBackend, SearchError, SearchHit, SearchHits,
    SearchRequest, SortField, SortOrder,
};
pub use batch::{BatchLimits, FlushTrigger, IndexBatch};
pub use elasticsearch::ElasticsearchBackend;
pub use memory::MemoryIndex;
pub use provisioner::ensure_index;
pub use schema::IndexSchema;
pub use writer::{BatchIndexWriter, WriterError, WriterStats, WriterStatsSnapshot};
