//! Storage integration tests.
//!
//! Verifies:
//! - Adapter save/load/remove through the RocksDB backend
//! - Data survives closing and reopening the database
//! - Range queries respect segment boundaries
//! - Range removal leaves siblings alone

use std::sync::Arc;
use syncroom_relay::storage::{
    BlobStore, RocksBlobStore, StorageAdapter, StorageKey, StoreConfig, StoreError,
};
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn key(segments: &[&str]) -> StorageKey {
    StorageKey::new(segments.iter().copied()).unwrap()
}

fn rocks_adapter(config: StoreConfig) -> StorageAdapter {
    StorageAdapter::new(Arc::new(RocksBlobStore::open(config).unwrap()))
}

// ─── Point operations ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_save_load_remove_rocksdb() {
    let dir = tempdir().unwrap();
    let storage = rocks_adapter(StoreConfig::for_testing(dir.path().join("db")));
    let k = key(&["doc1", "snapshot", "abc"]);

    assert_eq!(storage.load(&k).await.unwrap(), None);
    storage.save(&k, b"state".to_vec()).await.unwrap();
    assert_eq!(storage.load(&k).await.unwrap(), Some(b"state".to_vec()));

    storage.remove(&k).await.unwrap();
    storage.remove(&k).await.unwrap();
    assert_eq!(storage.load(&k).await.unwrap(), None);
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

    {
        let store = Arc::new(RocksBlobStore::open(config.clone()).unwrap());
        let storage = StorageAdapter::new(store.clone());
        storage
            .save(&key(&["doc1", "snapshot"]), payload.clone())
            .await
            .unwrap();
        store.flush().unwrap();
    }

    let storage = rocks_adapter(config);
    assert_eq!(
        storage.load(&key(&["doc1", "snapshot"])).await.unwrap(),
        Some(payload)
    );
}

#[tokio::test]
async fn test_keys_with_slash_rejected() {
    assert!(matches!(
        StorageKey::new(["doc/1", "snapshot"]),
        Err(StoreError::InvalidKey(_))
    ));
    assert!(matches!(
        StorageKey::new(["doc1", ""]),
        Err(StoreError::InvalidKey(_))
    ));
}

// ─── Range operations ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_range_prefix_isolation_rocksdb() {
    let dir = tempdir().unwrap();
    let storage = rocks_adapter(StoreConfig::for_testing(dir.path().join("db")));

    storage.save(&key(&["doc1", "a"]), b"1a".to_vec()).await.unwrap();
    storage.save(&key(&["doc1", "b"]), b"1b".to_vec()).await.unwrap();
    storage.save(&key(&["doc10", "a"]), b"10a".to_vec()).await.unwrap();
    storage.save(&key(&["doc2", "a"]), b"2a".to_vec()).await.unwrap();

    let chunks = storage.load_range(&key(&["doc1"])).await.unwrap();
    let keys: Vec<String> = chunks.iter().map(|c| c.key.flatten()).collect();
    assert_eq!(keys, vec!["doc1/a", "doc1/b"]);
    assert!(chunks.iter().all(|c| c.data.is_some()));

    let everything = storage.load_range(&StorageKey::root()).await.unwrap();
    assert_eq!(everything.len(), 4);
}

#[tokio::test]
async fn test_remove_range_rocksdb() {
    let dir = tempdir().unwrap();
    let storage = rocks_adapter(StoreConfig::for_testing(dir.path().join("db")));

    for i in 0..10u8 {
        storage
            .save(&key(&["doc1", "incremental", &format!("h{i}")]), vec![i])
            .await
            .unwrap();
    }
    storage.save(&key(&["doc1", "snapshot"]), b"s".to_vec()).await.unwrap();
    storage.save(&key(&["doc10", "snapshot"]), b"t".to_vec()).await.unwrap();

    let removed = storage
        .remove_range(&key(&["doc1", "incremental"]))
        .await
        .unwrap();
    assert_eq!(removed, 10);

    assert!(storage
        .load_range(&key(&["doc1", "incremental"]))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        storage.load(&key(&["doc1", "snapshot"])).await.unwrap(),
        Some(b"s".to_vec())
    );
    assert_eq!(
        storage.load(&key(&["doc10", "snapshot"])).await.unwrap(),
        Some(b"t".to_vec())
    );
}

#[tokio::test]
async fn test_uncompressed_backend() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        compress_values: false,
        ..StoreConfig::for_testing(dir.path().join("db"))
    };
    let store = Arc::new(RocksBlobStore::open(config).unwrap());
    let storage = StorageAdapter::new(store.clone());

    storage.save(&key(&["doc1", "x"]), vec![3; 1024]).await.unwrap();
    assert_eq!(store.get("doc1/x").unwrap(), Some(vec![3; 1024]));
    assert_eq!(store.list("doc1/").unwrap(), vec!["doc1/x".to_string()]);
}
