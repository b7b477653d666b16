//! RocksDB-backed blob store.
//!
//! All blobs live in one column family, `blobs`, keyed by the flat key's
//! UTF-8 bytes. RocksDB keeps keys sorted, so a prefix listing is a forward
//! seek plus a scan that stops at the first non-matching key.
//!
//! Values carry a one-byte header so that toggling `compress_values` never
//! strands data written under the other setting:
//! - `0x00` raw payload
//! - `0x01` LZ4 block, uncompressed size prepended
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::blob::BlobStore;
use super::StoreError;

const CF_BLOBS: &str = "blobs";

const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 64MB)
    pub write_buffer_size: usize,
    /// LZ4-compress values before writing (default: true)
    pub compress_values: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("syncroom_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
            compress_values: true,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            compress_values: true,
        }
    }
}

/// RocksDB-backed [`BlobStore`].
pub struct RocksBlobStore {
    /// Single-threaded mode: column families are fixed at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBlobStore {
    /// Open the store, creating the database if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf = ColumnFamilyDescriptor::new(CF_BLOBS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![cf],
        )?;

        log::info!("Opened blob store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Already-compressed values gain nothing from a second pass
        if config.compress_values {
            opts.set_compression_type(DBCompressionType::None);
        } else {
            opts.set_compression_type(DBCompressionType::Lz4);
        }
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_BLOBS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_BLOBS}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn encode_value(&self, value: &[u8]) -> Vec<u8> {
        if self.config.compress_values {
            let compressed = lz4_flex::compress_prepend_size(value);
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            out
        } else {
            let mut out = Vec::with_capacity(value.len() + 1);
            out.push(TAG_RAW);
            out.extend_from_slice(value);
            out
        }
    }

    fn decode_value(stored: &[u8]) -> Result<Vec<u8>, StoreError> {
        match stored.split_first() {
            Some((&TAG_RAW, body)) => Ok(body.to_vec()),
            Some((&TAG_LZ4, body)) => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| StoreError::Compression(e.to_string())),
            Some((tag, _)) => Err(StoreError::Database(format!("Unknown value tag {tag:#04x}"))),
            None => Err(StoreError::Database("Empty stored value".into())),
        }
    }
}

impl BlobStore for RocksBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.db.get_cf(self.cf()?, key.as_bytes())? {
            Some(stored) => Self::decode_value(&stored).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let encoded = self.encode_value(value);
        self.db
            .put_cf_opt(self.cf()?, key.as_bytes(), &encoded, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .delete_cf_opt(self.cf()?, key.as_bytes(), &self.write_options())?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let iter = self.db.iterator_cf(
            self.cf()?,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_open() {
        let dir = tempdir().unwrap();
        let store = RocksBlobStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = RocksBlobStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        assert_eq!(store.get("doc1/snapshot").unwrap(), None);
        store.put("doc1/snapshot", b"state").unwrap();
        assert_eq!(store.get("doc1/snapshot").unwrap(), Some(b"state".to_vec()));

        store.delete("doc1/snapshot").unwrap();
        store.delete("doc1/snapshot").unwrap();
        assert_eq!(store.get("doc1/snapshot").unwrap(), None);
    }

    #[test]
    fn test_list_stops_at_prefix_end() {
        let dir = tempdir().unwrap();
        let store = RocksBlobStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        for key in ["doc0/x", "doc1/a", "doc1/b", "doc10/a", "doc2/a"] {
            store.put(key, b"v").unwrap();
        }

        assert_eq!(store.list("doc1/").unwrap(), vec!["doc1/a", "doc1/b"]);
        assert_eq!(store.list("").unwrap().len(), 5);
    }

    #[test]
    fn test_empty_value() {
        let dir = tempdir().unwrap();
        let store = RocksBlobStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        store.put("k", b"").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksBlobStore::open(config.clone()).unwrap();
            store.put("doc1/snapshot", &vec![42u8; 100_000]).unwrap();
            store.flush().unwrap();
        }

        let store = RocksBlobStore::open(config).unwrap();
        let loaded = store.get("doc1/snapshot").unwrap().unwrap();
        assert_eq!(loaded.len(), 100_000);
        assert!(loaded.iter().all(|b| *b == 42));
    }

    #[test]
    fn test_compression_setting_can_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksBlobStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.put("compressed", &vec![7u8; 4096]).unwrap();
        }

        let config = StoreConfig {
            compress_values: false,
            ..StoreConfig::for_testing(&path)
        };
        let store = RocksBlobStore::open(config).unwrap();
        store.put("raw", b"plain").unwrap();

        assert_eq!(store.get("compressed").unwrap(), Some(vec![7u8; 4096]));
        assert_eq!(store.get("raw").unwrap(), Some(b"plain".to_vec()));
    }

    #[test]
    fn test_corrupt_tag_reported() {
        assert!(RocksBlobStore::decode_value(&[0x09, 1, 2]).is_err());
        assert!(RocksBlobStore::decode_value(&[]).is_err());
        assert_eq!(RocksBlobStore::decode_value(&[0x00, 5]).unwrap(), vec![5]);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert!(config.compress_values);
    }
}
