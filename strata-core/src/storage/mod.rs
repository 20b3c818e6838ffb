//! Storage engine - coordinates the live and historical parts of every key

mod cache;
mod engine;

pub use cache::LiveSegmentedCache;
pub use engine::{LockedRange, TimeSeriesDb, TimeSeriesDbBuilder};

use crate::chunk::CompressionKind;
use crate::kv::StoreBackend;
use crate::update::{WriteOptions, WriteStrategy};
use std::path::PathBuf;
use std::time::Duration;

/// Where live values are kept until their segment is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveSegmentMode {
    /// Live values exist only in memory and are lost on restart
    #[default]
    InMemory,
    /// Every live value is also journaled into the metadata store and
    /// restored when the table is reopened
    WriteThrough,
}

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory; every table lives in its own subdirectory
    pub data_dir: PathBuf,
    /// Metadata store backend
    pub backend: StoreBackend,
    /// Chunk compression
    pub compression: CompressionKind,
    /// Values per chunk
    pub batch_size: usize,
    /// Encoding strategy of bulk updates
    pub write_strategy: WriteStrategy,
    /// Re-batch a partially filled tail chunk on the next update
    pub redo_last_chunk: bool,
    /// Longest wait for a key's write lock before a bulk update gives up
    pub update_lock_timeout: Duration,
    /// Longest wait for a key's write lock before a delete gives up
    pub delete_lock_timeout: Duration,
    /// Size at which segment files roll over
    pub max_mapped_file_size: u64,
    /// Segments kept memory-mapped; the least recently read is unmapped first
    pub max_open_segments: usize,
    /// Tables older than this are purged on their next access
    pub max_table_age: Option<Duration>,
    /// Live segment durability
    pub live_mode: LiveSegmentMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backend: StoreBackend::default(),
            compression: CompressionKind::default(),
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            write_strategy: WriteStrategy::default(),
            redo_last_chunk: true,
            update_lock_timeout: Duration::from_secs(crate::config::UPDATE_LOCK_TIMEOUT_SECS),
            delete_lock_timeout: Duration::from_secs(crate::config::DELETE_LOCK_TIMEOUT_SECS),
            max_mapped_file_size: crate::config::MAX_MAPPED_FILE_SIZE,
            max_open_segments: crate::config::DEFAULT_MAX_OPEN_SEGMENTS,
            max_table_age: None,
            live_mode: LiveSegmentMode::default(),
        }
    }
}

impl StorageConfig {
    /// Write path settings derived from this configuration
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            compression: self.compression,
            batch_size: self.batch_size,
            max_mapped_file_size: self.max_mapped_file_size,
            max_open_segments: self.max_open_segments,
            redo_last_chunk: self.redo_last_chunk,
            strategy: self.write_strategy,
        }
    }
}
