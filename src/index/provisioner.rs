//! Idempotent index creation.

use crate::index::backend::{SearchBackend, SearchError};
use crate::index::schema::IndexSchema;

/// Make sure `index` exists with `schema`.
///
/// Safe to call from many workers at once: losing the creation race is success.
pub async fn ensure_index<B: SearchBackend>(
    backend: &B,
    index: &str,
    schema: &IndexSchema,
) -> Result<(), SearchError> {
    if backend.index_exists(index).await? {
        tracing::debug!(index, "Index already present");
        return Ok(());
    }

    match backend.create_index(index, schema).await {
        Ok(()) => {
            tracing::info!(
                index,
                shards = schema.shards,
                replicas = schema.replicas,
                "Created index"
            );
            Ok(())
        }
        Err(SearchError::IndexAlreadyExists(_)) => {
            tracing::info!(index, "Index was created concurrently");
            Ok(())
        }
        Err(e) => {
            tracing::error!(index, error = %e, "Failed to create index");
            Err(e)
        }
    }
}
