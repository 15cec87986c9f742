//! Search backend interface.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::event::{AccessLogEvent, CodecError};
use crate::index::schema::IndexSchema;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("index {0} already exists")]
    IndexAlreadyExists(String),

    #[error("index {0} not found")]
    IndexNotFound(String),

    #[error("search backend request timed out")]
    Timeout,

    #[error("search backend unreachable: {0}")]
    Transport(String),

    #[error("search backend returned {status}: {reason}")]
    Rejected { status: u16, reason: String },

    #[error("malformed search backend response: {0}")]
    Response(String),

    #[error("invalid search configuration: {0}")]
    Config(String),
}

impl SearchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SearchError::Timeout | SearchError::Transport(_) => true,
            SearchError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// One document in a bulk request, written with an `index` action.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: String,
    pub body: Bytes,
}

impl IndexDocument {
    /// Document for an event, keyed by its trace number so re-indexing upserts.
    pub fn from_event(event: &AccessLogEvent) -> Result<Self, CodecError> {
        Ok(Self {
            id: event.document_id(),
            body: event.encode()?,
        })
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

/// Per-document result of a bulk write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub indexed: usize,
    pub failures: Vec<BulkFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

impl SortField {
    /// `field` sorts ascending, `-field` descending.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                order: SortOrder::Desc,
            },
            None => Self {
                field: raw.trim_start_matches('+').to_string(),
                order: SortOrder::Asc,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub from: usize,
    pub size: usize,
    pub sort: Vec<SortField>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            from: 0,
            size: 10,
            sort: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub source: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

/// A document store the pipeline indexes into.
pub trait SearchBackend: Send + Sync + 'static {
    fn index_exists(&self, index: &str) -> impl Future<Output = Result<bool, SearchError>> + Send;

    /// Fails with [`SearchError::IndexAlreadyExists`] if another caller won the race.
    fn create_index(
        &self,
        index: &str,
        schema: &IndexSchema,
    ) -> impl Future<Output = Result<(), SearchError>> + Send;

    fn bulk(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> impl Future<Output = Result<BulkOutcome, SearchError>> + Send;

    fn search(
        &self,
        index: &str,
        request: &SearchRequest,
    ) -> impl Future<Output = Result<SearchHits, SearchError>> + Send;
}

impl<T: SearchBackend> SearchBackend for Arc<T> {
    fn index_exists(&self, index: &str) -> impl Future<Output = Result<bool, SearchError>> + Send {
        (**self).index_exists(index)
    }

    fn create_index(
        &self,
        index: &str,
        schema: &IndexSchema,
    ) -> impl Future<Output = Result<(), SearchError>> + Send {
        (**self).create_index(index, schema)
    }

    fn bulk(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> impl Future<Output = Result<BulkOutcome, SearchError>> + Send {
        (**self).bulk(index, documents)
    }

    fn search(
        &self,
        index: &str,
        request: &SearchRequest,
    ) -> impl Future<Output = Result<SearchHits, SearchError>> + Send {
        (**self).search(index, request)
    }
}
