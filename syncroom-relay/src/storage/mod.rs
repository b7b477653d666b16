//! Key-addressed durable storage for the merge engine.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  StorageKey   ┌────────────────┐  flat "a/b/c"  ┌─────────────┐
//! │ Merge Engine │ ────────────► │ StorageAdapter │ ─────────────► │  BlobStore  │
//! │              │ ◄──────────── │ (async)        │ ◄───────────── │ (blocking)  │
//! └──────────────┘  Chunk / bytes└────────────────┘  bytes / keys  └──────┬──────┘
//!                                                                         │
//!                                                          ┌──────────────┴───────────┐
//!                                                          ▼                          ▼
//!                                                   MemoryBlobStore           RocksBlobStore
//! ```
//!
//! The adapter owns the key flattening and the prefix rules; backends only
//! see flat string keys. Nothing here is transactional across keys.

pub mod adapter;
pub mod blob;
pub mod key;
pub mod rocks;

pub use adapter::{Chunk, StorageAdapter};
pub use blob::{BlobStore, MemoryBlobStore};
pub use key::{StorageKey, SEPARATOR};
pub use rocks::{RocksBlobStore, StoreConfig};

use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage task failed: {0}")]
    Task(String),
    #[error("Storage lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
