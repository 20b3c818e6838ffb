//! In-memory ordered store

use super::{BatchOp, RangeStore, WriteBatch};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Table = BTreeMap<String, BTreeMap<i64, Vec<u8>>>;

/// Ordered map of hash keys to range-keyed entries
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries across all hash keys
    pub fn len(&self) -> usize {
        self.data.read().values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn apply(&self, batch: &WriteBatch) {
        let mut data = self.data.write();
        for op in batch.ops() {
            apply_op(&mut data, op);
        }
    }

    /// Snapshot of every entry, used to rewrite a compacted log
    pub(crate) fn snapshot(&self) -> WriteBatch {
        let data = self.data.read();
        let mut batch = WriteBatch::new();
        for (hash_key, entries) in data.iter() {
            for (range_key, value) in entries {
                batch.put(hash_key, *range_key, value.clone());
            }
        }
        batch
    }
}

fn apply_op(data: &mut Table, op: &BatchOp) {
    match op {
        BatchOp::Put {
            hash_key,
            range_key,
            value,
        } => {
            data.entry(hash_key.clone())
                .or_default()
                .insert(*range_key, value.clone());
        }
        BatchOp::Delete {
            hash_key,
            range_key,
        } => {
            if let Some(entries) = data.get_mut(hash_key) {
                entries.remove(range_key);
                if entries.is_empty() {
                    data.remove(hash_key);
                }
            }
        }
        BatchOp::DeleteRange { hash_key } => {
            data.remove(hash_key);
        }
    }
}

impl RangeStore for MemoryStore {
    fn get(&self, hash_key: &str, range_key: i64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .get(hash_key)
            .and_then(|entries| entries.get(&range_key))
            .cloned())
    }

    fn range(&self, hash_key: &str, from: i64, to: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        if from > to {
            return Ok(Vec::new());
        }
        let data = self.data.read();
        Ok(data
            .get(hash_key)
            .map(|entries| {
                entries
                    .range(from..=to)
                    .map(|(k, v)| (*k, v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn hash_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .map(|(hash_key, _)| hash_key)
            .take_while(|hash_key| hash_key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.apply(&batch);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
