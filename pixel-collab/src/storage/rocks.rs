//! RocksDB-backed canvas store.
//!
//! Column families:
//! - `cells`    — one record per coordinate, key `x:u32 BE ‖ y:u32 BE`, value the color
//! - `updates`  — update log, key `sequence:u64 BE`, value a bincode [`MutationRecord`]
//! - `metadata` — provisioned board dimensions (bincode [`BoardMetadata`])
//!
//! Big-endian keys make a full scan of `cells` come back in column-major
//! order and a scan of `updates` come back in acceptance order.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    AuditEntry, BoardMetadata, BoardStore, CellRecord, MutationRecord, StoreError, UpdateLog,
};
use crate::protocol::Color;

const CF_CELLS: &str = "cells";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_CELLS, CF_UPDATES, CF_METADATA];

const METADATA_KEY: &[u8] = b"board";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pixel_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Store at `path` with otherwise default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed implementation of [`BoardStore`] and [`UpdateLog`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode: writes come from one task)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next update-log sequence number
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        log::debug!(
            "Opened canvas store at {} (next update sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CELLS => {
                // Point overwrites, full scan on startup only
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Sequential appends, never updated
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next sequence number from the last key in `updates`.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_UPDATES) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Next sequence number the update log will assign.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn cell_key(x: u32, y: u32) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&x.to_be_bytes());
        key[4..].copy_from_slice(&y.to_be_bytes());
        key
    }

    fn decode_cell(key: &[u8], value: &[u8]) -> Option<CellRecord> {
        if key.len() != 8 {
            return None;
        }
        let mut x = [0u8; 4];
        let mut y = [0u8; 4];
        x.copy_from_slice(&key[..4]);
        y.copy_from_slice(&key[4..]);
        let color = std::str::from_utf8(value).ok()?.parse::<Color>().ok()?;
        Some(CellRecord::new(u32::from_be_bytes(x), u32::from_be_bytes(y), color))
    }
}

impl BoardStore for RocksStore {
    fn scan_all(&self) -> Result<Vec<CellRecord>, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut cells = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match Self::decode_cell(&key, &value) {
                Some(cell) => cells.push(cell),
                None => log::warn!("Skipping unreadable cell record (key {} bytes)", key.len()),
            }
        }

        Ok(cells)
    }

    fn upsert(&self, x: u32, y: u32, color: &Color) -> Result<(), StoreError> {
        let cf = self.cf(CF_CELLS)?;
        self.db.put_cf_opt(
            cf,
            Self::cell_key(x, y),
            color.as_str().as_bytes(),
            &self.write_options(),
        )?;
        Ok(())
    }

    /// Single atomic batch, so a crash mid-provisioning leaves either all
    /// of the fill or none of it.
    fn upsert_batch(&self, cells: &[CellRecord]) -> Result<(), StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut batch = WriteBatch::default();
        for cell in cells {
            batch.put_cf(cf, Self::cell_key(cell.x, cell.y), cell.color.as_str().as_bytes());
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn load_metadata(&self) -> Result<Option<BoardMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, METADATA_KEY)? {
            Some(bytes) => {
                let (meta, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn save_metadata(&self, metadata: &BoardMetadata) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let bytes = bincode::serde::encode_to_vec(metadata, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.db.put_cf_opt(cf, METADATA_KEY, bytes, &self.write_options())?;
        Ok(())
    }
}

impl UpdateLog for RocksStore {
    fn append(&self, entry: AuditEntry) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let record = MutationRecord::seal(seq, entry);

        self.db
            .put_cf_opt(cf, seq.to_be_bytes(), record.encode()?, &self.write_options())?;
        Ok(seq)
    }

    fn read_since(&self, since: u64) -> Result<Vec<MutationRecord>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start_key = since.to_be_bytes();

        let mut serialized = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (_, value) = item?;
            serialized.push(value.to_vec());
        }

        let (records, corrupted) = MutationRecord::recover(&serialized);
        if corrupted > 0 {
            log::warn!("Update log read skipped {corrupted} corrupted records");
        }
        Ok(records)
    }
}
