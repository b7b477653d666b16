//! Async storage adapter used by the merge engine.
//!
//! Maps [`StorageKey`]s onto a [`BlobStore`]'s flat namespace and runs the
//! store's blocking calls on tokio's blocking pool.
//!
//! Range operations are not transactional: a failure partway through
//! `remove_range` leaves earlier deletions in place and returns the error.
//! Callers that need exact completion must re-check.

use std::sync::Arc;

use super::blob::{BlobStore, MemoryBlobStore};
use super::key::StorageKey;
use super::StoreError;

/// A key returned by a range query, with its payload if it could be read.
///
/// `data == None` means the key was listed but the blob was gone by the time
/// it was fetched. Treat it as a miss, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub key: StorageKey,
    pub data: Option<Vec<u8>>,
}

/// Storage front-end handed to the merge engine. Cheap to clone.
#[derive(Clone)]
pub struct StorageAdapter {
    store: Arc<dyn BlobStore>,
}

impl StorageAdapter {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Adapter over a fresh [`MemoryBlobStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    /// Fetch one blob. Absence is `Ok(None)`.
    pub async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        let flat = point_key(key)?;
        self.blocking(move |store| store.get(&flat)).await
    }

    /// Overwrite the blob at `key`.
    pub async fn save(&self, key: &StorageKey, data: Vec<u8>) -> Result<(), StoreError> {
        let flat = point_key(key)?;
        log::trace!("save {flat} ({} bytes)", data.len());
        self.blocking(move |store| store.put(&flat, &data)).await
    }

    /// Delete the blob at `key`. Deleting a missing key succeeds.
    pub async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        let flat = point_key(key)?;
        self.blocking(move |store| store.delete(&flat)).await
    }

    /// Load every blob stored under `prefix`, in the store's listing order.
    pub async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<Chunk>, StoreError> {
        let flat_prefix = prefix.range_prefix();
        self.blocking(move |store| {
            let mut chunks = Vec::new();
            for flat in store.list(&flat_prefix)? {
                let Some(key) = parse_listed(&flat) else {
                    continue;
                };
                let data = store.get(&flat)?;
                if data.is_none() {
                    log::debug!("{flat} listed but not readable");
                }
                chunks.push(Chunk { key, data });
            }
            Ok(chunks)
        })
        .await
    }

    /// Delete every blob stored under `prefix`. Returns how many were deleted.
    pub async fn remove_range(&self, prefix: &StorageKey) -> Result<usize, StoreError> {
        let flat_prefix = prefix.range_prefix();
        let removed = self
            .blocking(move |store| {
                let keys = store.list(&flat_prefix)?;
                for flat in &keys {
                    store.delete(flat)?;
                }
                Ok(keys.len())
            })
            .await?;
        log::debug!("Removed {removed} blobs under {prefix}");
        Ok(removed)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BlobStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn point_key(key: &StorageKey) -> Result<String, StoreError> {
    if key.is_root() {
        return Err(StoreError::InvalidKey("empty key".into()));
    }
    Ok(key.flatten())
}

fn parse_listed(flat: &str) -> Option<StorageKey> {
    match StorageKey::unflatten(flat) {
        Ok(key) => Some(key),
        Err(e) => {
            log::warn!("Skipping foreign key {flat:?}: {e}");
            None
        }
    }
}
