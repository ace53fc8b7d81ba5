//! RocksDB-backed persistent map.
//!
//! Column families:
//! - `entries` — one record per key: `{value, version}` as JSON, LZ4 compressed
//!
//! This layer knows nothing about versions beyond storing them. Every call
//! is individually atomic; there are no multi-key transactions.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, IteratorMode, Options,
    WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::version::Version;

/// Column family holding the map records.
const CF_ENTRIES: &str = "entries";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding all named stores
    pub root: PathBuf,
    /// Store name; the same name always opens the same data
    pub name: String,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tandem_data"),
            name: "default".to_string(),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Named store under `root` with default tuning.
    pub fn named(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 32,
            write_buffer_size: 1024 * 1024,
        }
    }

    /// On-disk location of this store.
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// A stored value together with the version that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: serde_json::Value,
    pub version: Version,
}

impl Entry {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let json =
            serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Durable key → `{value, version}` dictionary.
///
/// Cloning is cheap; clones share the open database. RocksDB work runs on
/// tokio's blocking pool so callers on the async runtime never stall.
#[derive(Clone)]
pub struct PersistentMap {
    db: Arc<DB>,
    config: Arc<StoreConfig>,
}

impl PersistentMap {
    /// Open (or create) the named store.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf = ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options(&config));
        let db = DB::open_cf_descriptors(&db_opts, config.path(), vec![cf])?;

        log::debug!("Opened store '{}' at {}", config.name, config.path().display());
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Records arrive LZ4-compressed already.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Fetch the record for `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let db = self.db.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let cf = cf_handle(&db)?;
            match db.get_pinned_cf(cf, key.as_bytes())? {
                Some(bytes) => Entry::decode(&bytes).map(Some),
                None => Ok(None),
            }
        })
        .await?
    }

    /// Upsert `key`, replacing any previous record wholesale.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        version: Version,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let key = key.to_owned();
        let sync = self.config.sync_writes;
        let encoded = Entry { value, version }.encode()?;
        tokio::task::spawn_blocking(move || {
            let cf = cf_handle(&db)?;
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(sync);
            db.put_cf_opt(cf, key.as_bytes(), &encoded, &write_opts)?;
            Ok(())
        })
        .await?
    }

    /// Whether a record exists for `key`.
    pub async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let db = self.db.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let cf = cf_handle(&db)?;
            Ok(db.get_pinned_cf(cf, key.as_bytes())?.is_some())
        })
        .await?
    }

    /// All keys in byte order.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let cf = cf_handle(&db)?;
            let mut keys = Vec::new();
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                let key = String::from_utf8(key.into_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                keys.push(key);
            }
            Ok(keys)
        })
        .await?
    }

    /// Number of stored keys.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let cf = cf_handle(&db)?;
            let mut count = 0;
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                item?;
                count += 1;
            }
            Ok(count)
        })
        .await?
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }
}

fn cf_handle(db: &DB) -> Result<&rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(CF_ENTRIES)
        .ok_or_else(|| StoreError::Database(format!("Column family '{CF_ENTRIES}' not found")))
}
