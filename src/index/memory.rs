//! In-process search backend.
//!
//! Index creation is atomic, documents are upserted by id, and every call is
//! recorded so tests can assert on how the writer batched its work.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::index::backend::{
    BulkFailure, BulkOutcome, IndexDocument, SearchBackend, SearchError, SearchHit, SearchHits,
    SearchRequest, SortOrder,
};
use crate::index::schema::IndexSchema;

#[derive(Debug, Default)]
struct StoredIndex {
    schema: Option<IndexSchema>,
    documents: DashMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    indices: DashMap<String, Arc<StoredIndex>>,
    created: AtomicUsize,
    failing_requests: AtomicU32,
    hide_existing: AtomicBool,
    rejected_ids: Mutex<HashSet<String>>,
    bulk_sizes: Mutex<Vec<usize>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful index creations so far.
    pub fn indices_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make the next `count` requests fail as if the backend were unreachable.
    pub fn fail_next_requests(&self, count: u32) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    /// Report every index as missing, to force callers into the creation race.
    pub fn hide_existing_indices(&self, hide: bool) {
        self.hide_existing.store(hide, Ordering::SeqCst);
    }

    /// Reject this document id in every future bulk request.
    pub fn reject_document(&self, id: impl Into<String>) {
        if let Ok(mut rejected) = self.rejected_ids.lock() {
            rejected.insert(id.into());
        }
    }

    /// Document count of each bulk request received, in order.
    pub fn bulk_sizes(&self) -> Vec<usize> {
        self.bulk_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indices
            .get(index)
            .map_or(0, |stored| stored.documents.len())
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        let stored = self.indices.get(index)?.clone();
        let document = stored.documents.get(id)?.clone();
        Some(document)
    }

    pub fn schema(&self, index: &str) -> Option<IndexSchema> {
        self.indices.get(index).and_then(|stored| stored.schema.clone())
    }

    fn injected_failure(&self) -> Result<(), SearchError> {
        let result = self
            .failing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match result {
            Ok(_) => Err(SearchError::Transport("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn is_rejected(&self, id: &str) -> bool {
        self.rejected_ids
            .lock()
            .map(|rejected| rejected.contains(id))
            .unwrap_or(false)
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> CmpOrdering {
    match (a.get(field), b.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

impl SearchBackend for MemoryIndex {
    async fn index_exists(&self, index: &str) -> Result<bool, SearchError> {
        self.injected_failure()?;
        if self.hide_existing.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, schema: &IndexSchema) -> Result<(), SearchError> {
        self.injected_failure()?;
        match self.indices.entry(index.to_string()) {
            Entry::Occupied(_) => Err(SearchError::IndexAlreadyExists(index.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(StoredIndex {
                    schema: Some(schema.clone()),
                    documents: DashMap::new(),
                }));
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn bulk(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> Result<BulkOutcome, SearchError> {
        self.injected_failure()?;
        if let Ok(mut sizes) = self.bulk_sizes.lock() {
            sizes.push(documents.len());
        }

        // Like a real cluster with automatic index creation, a bulk write into a
        // missing index creates it with default settings.
        let stored = self
            .indices
            .entry(index.to_string())
            .or_insert_with(|| Arc::new(StoredIndex::default()))
            .clone();

        let mut outcome = BulkOutcome::default();
        for document in documents {
            if self.is_rejected(&document.id) {
                outcome.failures.push(BulkFailure {
                    id: document.id.clone(),
                    status: 400,
                    reason: "document rejected".to_string(),
                });
                continue;
            }
            match serde_json::from_slice::<Value>(&document.body) {
                Ok(value) if value.is_object() => {
                    stored.documents.insert(document.id.clone(), value);
                    outcome.indexed += 1;
                }
                Ok(_) | Err(_) => outcome.failures.push(BulkFailure {
                    id: document.id.clone(),
                    status: 400,
                    reason: "mapper_parsing_exception".to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchHits, SearchError> {
        self.injected_failure()?;
        let stored = self
            .indices
            .get(index)
            .map(|stored| stored.clone())
            .ok_or_else(|| SearchError::IndexNotFound(index.to_string()))?;

        let mut hits: Vec<SearchHit> = stored
            .documents
            .iter()
            .map(|entry| SearchHit {
                id: entry.key().clone(),
                source: entry.value().clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            for sort in &request.sort {
                let ordering = compare_field(&a.source, &b.source, &sort.field);
                let ordering = match sort.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                };
                if ordering != CmpOrdering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });

        let total = hits.len() as u64;
        let hits = hits.into_iter().skip(request.from).take(request.size).collect();
        Ok(SearchHits { total, hits })
    }
}
