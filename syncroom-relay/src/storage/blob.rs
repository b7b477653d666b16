//! Flat-keyed blob store boundary.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::StoreError;

/// A generic prefix-addressable blob store.
///
/// Calls may block; the adapter runs them off the async runtime.
pub trait BlobStore: Send + Sync + 'static {
    /// Fetch one blob. `Ok(None)` when nothing is stored at `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the blob at `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete the blob at `key`. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every stored key that starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory store over an ordered map.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self.blobs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(blobs.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().map_err(|_| StoreError::Poisoned)?;
        blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().map_err(|_| StoreError::Poisoned)?;
        blobs.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let blobs = self.blobs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
