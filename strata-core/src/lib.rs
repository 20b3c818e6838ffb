//! Strata Core - Live-Segmented Time-Series Storage Engine
//!
//! Strata stores ordered series of values per key, optimized for:
//! - Bulk loading millions of historical values per key
//! - Appending live values one at a time
//! - Point lookups relative to a time (latest, n-th previous, n-th next)
//! - Lazy forward and backward range scans
//!
//! # Architecture
//!
//! Time is cut into segments by a [`segment::SegmentFinder`]. Every key has:
//!
//! - **Historical segments**: sealed, immutable chunk files in memory-mapped
//!   segment files, indexed in an ordered key-value store
//! - **Live segment**: the newest segment, held in memory (optionally
//!   journaled) until a value of a later segment arrives and seals it
//! - **Update pipeline**: bulk loader that encodes batches sequentially or
//!   on a worker pool while appending strictly in order
//!
//! [`storage::TimeSeriesDb`] ties both sides together behind one read-write
//! lock per key.

pub mod chunk;
pub mod kv;
pub mod live;
pub mod registry;
pub mod segment;
pub mod storage;
pub mod update;

mod error;
mod flock;
mod types;

pub use error::{Result, StrataError};
pub use registry::{Closeable, TableRegistry};
pub use storage::{LiveSegmentMode, LockedRange, StorageConfig, TimeSeriesDb, TimeSeriesDbBuilder};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Values per chunk
    pub const DEFAULT_BATCH_SIZE: usize = 10_000;

    /// Segment files roll over at this size (1GB)
    #[cfg(target_pointer_width = "64")]
    pub const MAX_MAPPED_FILE_SIZE: u64 = 1024 * 1024 * 1024;

    /// Segment files roll over at this size (256MB)
    #[cfg(not(target_pointer_width = "64"))]
    pub const MAX_MAPPED_FILE_SIZE: u64 = 256 * 1024 * 1024;

    /// Segments kept memory-mapped per table
    pub const DEFAULT_MAX_OPEN_SEGMENTS: usize = 256;

    /// Longest wait for a key's write lock during a bulk update
    pub const UPDATE_LOCK_TIMEOUT_SECS: u64 = 60;

    /// Longest wait for a key's write lock during a delete
    pub const DELETE_LOCK_TIMEOUT_SECS: u64 = 10;
}
