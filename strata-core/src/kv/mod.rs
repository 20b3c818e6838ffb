//! Ordered key-value store used for segment and chunk metadata
//!
//! Entries are addressed by `(hash_key, range_key)` and kept ordered by
//! range key within a hash key. Two backends are provided:
//! - [`MemoryStore`]: ordered in-memory map, nothing survives a restart
//! - [`LogStore`]: the same map replayed from a checksummed append-only log

mod log;
mod memory;

pub use self::log::LogStore;
pub use memory::MemoryStore;

use crate::flock::FileLock;
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Ordered `(hash_key, range_key) -> bytes` store
pub trait RangeStore: Send + Sync {
    /// Get a single entry
    fn get(&self, hash_key: &str, range_key: i64) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite an entry
    fn put(&self, hash_key: &str, range_key: i64, value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(hash_key, range_key, value.to_vec());
        self.write_batch(batch)
    }

    /// Remove an entry
    fn delete(&self, hash_key: &str, range_key: i64) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(hash_key, range_key);
        self.write_batch(batch)
    }

    /// Entries with `from <= range_key <= to`, ascending
    fn range(&self, hash_key: &str, from: i64, to: i64) -> Result<Vec<(i64, Vec<u8>)>>;

    /// Entries with `to <= range_key <= from`, descending
    fn range_reverse(&self, hash_key: &str, from: i64, to: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        let mut entries = self.range(hash_key, to, from)?;
        entries.reverse();
        Ok(entries)
    }

    /// Hash keys starting with `prefix`, ascending
    fn hash_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply all operations of the batch atomically
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Remove every entry of a hash key
    fn delete_range(&self, hash_key: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range(hash_key);
        self.write_batch(batch)
    }

    /// Make all writes durable
    fn flush(&self) -> Result<()>;
}

/// One mutation inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        hash_key: String,
        range_key: i64,
        value: Vec<u8>,
    },
    Delete {
        hash_key: String,
        range_key: i64,
    },
    DeleteRange {
        hash_key: String,
    },
}

/// Group of mutations applied together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, hash_key: &str, range_key: i64, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            hash_key: hash_key.to_string(),
            range_key,
            value,
        });
    }

    pub fn delete(&mut self, hash_key: &str, range_key: i64) {
        self.ops.push(BatchOp::Delete {
            hash_key: hash_key.to_string(),
            range_key,
        });
    }

    pub fn delete_range(&mut self, hash_key: &str) {
        self.ops.push(BatchOp::DeleteRange {
            hash_key: hash_key.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Storage backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Metadata kept in memory only
    Memory,
    /// Metadata replayed from an append-only log
    #[default]
    Log,
}

/// An opened metadata store together with the lock guarding its table
pub struct OpenedStore {
    pub store: Arc<dyn RangeStore>,
    pub lock: FileLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Second,
}

/// Open the metadata store in `dir`.
///
/// Two attempts at most: a retryable failure is retried once immediately,
/// and a corrupted store is destroyed and recreated once. A second failure
/// is returned to the caller; contention is always reported as retryable.
pub fn open_table(backend: StoreBackend, dir: &Path) -> Result<OpenedStore> {
    let mut attempt = Attempt::First;
    loop {
        match try_open(backend, dir) {
            Ok(opened) => return Ok(opened),
            Err(e) if attempt == Attempt::First && e.is_retryable() => {
                info!("Retrying open of {:?} after: {}", dir, e);
                attempt = Attempt::Second;
            }
            Err(e) if attempt == Attempt::First && e.is_corruption() => {
                warn!(
                    "Metadata store {:?} is corrupted ({}); destroying and recreating it",
                    dir, e
                );
                reset_dir(dir)?;
                attempt = Attempt::Second;
            }
            Err(e) if e.is_retryable() => {
                return Err(StrataError::Retryable(format!(
                    "Metadata store {:?} is in use: {}",
                    dir, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_open(backend: StoreBackend, dir: &Path) -> Result<OpenedStore> {
    std::fs::create_dir_all(dir)?;
    let lock = FileLock::lock(dir.join("LOCK"))?;
    let store: Arc<dyn RangeStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Log => Arc::new(LogStore::open(dir.join("index.log"))?),
    };
    Ok(OpenedStore { store, lock })
}

fn reset_dir(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        // The lock file may still be held by this process; keep it
        if path.file_name().map_or(false, |n| n == "LOCK") {
            continue;
        }
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_open_log_backend_persists() {
        let dir = TempDir::new().unwrap();
        {
            let opened = open_table(StoreBackend::Log, dir.path()).unwrap();
            opened.store.put("seg/a", 1, b"one").unwrap();
            opened.store.flush().unwrap();
        }
        let opened = open_table(StoreBackend::Log, dir.path()).unwrap();
        assert_eq!(opened.store.get("seg/a", 1).unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn test_corrupted_log_is_recreated() {
        let dir = TempDir::new().unwrap();
        {
            let opened = open_table(StoreBackend::Log, dir.path()).unwrap();
            opened.store.put("seg/a", 1, b"one").unwrap();
            opened.store.put("seg/a", 2, b"two").unwrap();
            opened.store.flush().unwrap();
        }

        // Flip a byte inside the first record
        let log_path = dir.path().join("index.log");
        let mut data = std::fs::read(&log_path).unwrap();
        data[6] ^= 0xFF;
        let mut file = std::fs::File::create(&log_path).unwrap();
        file.write_all(&data).unwrap();
        drop(file);

        let opened = open_table(StoreBackend::Log, dir.path()).unwrap();
        assert_eq!(opened.store.get("seg/a", 1).unwrap(), None);
        assert_eq!(opened.store.get("seg/a", 2).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_locked_table_is_retryable() {
        let dir = TempDir::new().unwrap();
        let _first = open_table(StoreBackend::Memory, dir.path()).unwrap();
        let err = open_table(StoreBackend::Memory, dir.path()).err().unwrap();
        assert!(matches!(err, StrataError::Retryable(_)));
    }

    #[test]
    fn test_write_batch_builder() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());
        batch.put("h", 1, vec![1]);
        batch.delete("h", 2);
        batch.delete_range("g");
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[2], BatchOp::DeleteRange { .. }));
    }
}
