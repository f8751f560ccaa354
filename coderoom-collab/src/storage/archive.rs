//! RocksDB-backed archive of evicted rooms.
//!
//! Column families:
//! - `rooms`    — LZ4-compressed bincode [`ArchivedRoom`] keyed by room id
//! - `metadata` — bincode [`ArchiveMetadata`] keyed by room id
//!
//! A room is written once when it is evicted and read back when a client
//! joins the same room id again, so the revision counter keeps growing
//! across the gap.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use crate::protocol::{Language, RoomId, RoomSettings};

const CF_ROOMS: &str = "rooms";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every archive write (default: true, writes are rare)
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("coderoom_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl ArchiveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Durable part of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedRoom {
    pub room_id: RoomId,
    pub buffer: String,
    pub language: Language,
    pub revision: u64,
    pub settings: RoomSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub revision: u64,
    pub raw_size: u64,
    pub compressed_size: u64,
    /// Seconds since the Unix epoch.
    pub archived_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Archive task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for ArchiveError {
    fn from(e: rocksdb::Error) -> Self {
        ArchiveError::Database(e.to_string())
    }
}

pub struct RoomArchive {
    db: DBWithThreadMode<SingleThreaded>,
    config: ArchiveConfig,
}

impl RoomArchive {
    /// Open the archive, creating the database and column families if needed.
    pub fn open(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room archive at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &ArchiveConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Store a room, replacing any earlier record for the same id.
    pub fn save(&self, room: &ArchivedRoom) -> Result<ArchiveMetadata, ArchiveError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = bincode::serde::encode_to_vec(room, bincode::config::standard())
            .map_err(|e| ArchiveError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let meta = ArchiveMetadata {
            revision: room.revision,
            raw_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            archived_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let meta_bytes = bincode::serde::encode_to_vec(&meta, bincode::config::standard())
            .map_err(|e| ArchiveError::Serialization(e.to_string()))?;

        let key = room.room_id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_rooms, key, &compressed);
        batch.put_cf(&cf_meta, key, &meta_bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Archived room {} at revision {} ({} -> {} bytes)",
            room.room_id,
            room.revision,
            meta.raw_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load(&self, room_id: &RoomId) -> Result<Option<ArchivedRoom>, ArchiveError> {
        let cf = self.cf(CF_ROOMS)?;
        let Some(compressed) = self.db.get_cf(&cf, room_id.as_str().as_bytes())? else {
            return Ok(None);
        };

        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;
        let (room, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| ArchiveError::Deserialization(e.to_string()))?;
        Ok(Some(room))
    }

    pub fn metadata(&self, room_id: &RoomId) -> Result<Option<ArchiveMetadata>, ArchiveError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_str().as_bytes())? {
            Some(bytes) => {
                let (meta, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| ArchiveError::Deserialization(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, room_id: &RoomId) -> Result<(), ArchiveError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = room_id.as_str().as_bytes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_rooms, key);
        batch.delete_cf(&cf_meta, key);
        self.db.write(batch)?;
        Ok(())
    }

    /// Every archived room id, in key order.
    pub fn list(&self) -> Result<Vec<RoomId>, ArchiveError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let raw = std::str::from_utf8(&key)
                .map_err(|e| ArchiveError::Deserialization(e.to_string()))?;
            let id = RoomId::parse(raw).map_err(|e| ArchiveError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn count(&self) -> Result<usize, ArchiveError> {
        Ok(self.list()?.len())
    }

    pub fn flush(&self) -> Result<(), ArchiveError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ArchiveError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ArchiveError::Database(format!("Column family '{name}' not found")))
    }
}

impl std::fmt::Debug for RoomArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomArchive")
            .field("path", &self.config.path)
            .finish()
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
