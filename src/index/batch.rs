//! The open batch and the thresholds that close it.

use std::time::Duration;

use crate::config::SearchConfig;
use crate::index::backend::IndexDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_actions: usize,
    pub max_bytes: usize,
    pub flush_interval: Duration,
}

impl BatchLimits {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            max_actions: config.bulk_actions,
            max_bytes: config.bulk_size,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        }
    }
}

/// Why a batch was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Bytes,
    Interval,
    Manual,
    Close,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Count => "count",
            FlushTrigger::Bytes => "bytes",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Close => "close",
        }
    }
}

#[derive(Debug, Default)]
pub struct IndexBatch {
    documents: Vec<IndexDocument>,
    bytes: usize,
}

impl IndexBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, document: IndexDocument) {
        self.bytes += document.size();
        self.documents.push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// The size threshold this batch has crossed, if any. Count wins ties.
    pub fn is_full(&self, limits: &BatchLimits) -> Option<FlushTrigger> {
        if self.documents.len() >= limits.max_actions {
            Some(FlushTrigger::Count)
        } else if self.bytes >= limits.max_bytes {
            Some(FlushTrigger::Bytes)
        } else {
            None
        }
    }

    /// Hand over the documents and start a new, empty batch.
    pub fn take(&mut self) -> Vec<IndexDocument> {
        self.bytes = 0;
        std::mem::take(&mut self.documents)
    }
}
