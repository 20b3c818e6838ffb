//! Live segment
//!
//! The newest, still mutable segment of a key. Values are appended in
//! strictly increasing `end_time` order and kept in a sorted vector, so
//! every lookup is a binary search and positions stay stable while the
//! segment lives. Optionally every accepted value is journaled into the
//! metadata store so the segment survives a restart.

use crate::chunk::ValueSerializer;
use crate::kv::RangeStore;
use crate::segment::HistoricalSegmentTable;
use crate::types::Shifted;
use crate::{Result, SegmentedKey, SeriesKey, StrataError, TimeRange, TimeSeriesValue, Timestamp, MAX_TIME, MIN_TIME};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) fn live_hash(hash_key: &str) -> String {
    format!("live/{}", hash_key)
}

/// Write-through journal of one key's live values
pub struct LiveJournal<V> {
    store: Arc<dyn RangeStore>,
    hash_key: String,
    serializer: Arc<dyn ValueSerializer<V>>,
}

impl<V: TimeSeriesValue> LiveJournal<V> {
    pub fn new(store: Arc<dyn RangeStore>, hash_key: &str, serializer: Arc<dyn ValueSerializer<V>>) -> Self {
        Self {
            store,
            hash_key: live_hash(hash_key),
            serializer,
        }
    }

    fn append(&self, time: Timestamp, value: &V) -> Result<()> {
        self.store.put(&self.hash_key, time, &self.serializer.to_bytes(value)?)
    }

    /// Journaled values in time order
    pub fn load(&self) -> Result<Vec<(Timestamp, V)>> {
        self.store
            .range(&self.hash_key, MIN_TIME, MAX_TIME)?
            .into_iter()
            .map(|(time, bytes)| Ok((time, self.serializer.decode(&bytes)?)))
            .collect()
    }

    pub fn clear(&self) -> Result<()> {
        self.store.delete_range(&self.hash_key)
    }
}

/// The mutable tail segment of one key
pub struct LiveSegment<K, V> {
    segmented_key: SegmentedKey<K>,
    entries: Vec<(Timestamp, V)>,
    journal: Option<LiveJournal<V>>,
}

impl<K: SeriesKey, V: TimeSeriesValue> LiveSegment<K, V> {
    pub fn new(key: K, segment: TimeRange, journal: Option<LiveJournal<V>>) -> Self {
        Self {
            segmented_key: SegmentedKey::new(key, segment),
            entries: Vec::new(),
            journal,
        }
    }

    /// Rebuild a live segment from journaled values
    pub fn restore(key: K, segment: TimeRange, journal: LiveJournal<V>) -> Result<Self> {
        let entries = journal.load()?;
        if let Some((time, _)) = entries.iter().find(|(time, _)| !segment.contains(*time)) {
            return Err(StrataError::Corruption(format!(
                "Journaled live value at {} of {:?} lies outside segment {}",
                time, key, segment
            )));
        }
        debug!("Restored {} live values of {:?}", entries.len(), key);
        Ok(Self {
            segmented_key: SegmentedKey::new(key, segment),
            entries,
            journal: Some(journal),
        })
    }

    pub fn segment(&self) -> TimeRange {
        self.segmented_key.segment
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time of the newest value
    pub fn last_key(&self) -> Option<Timestamp> {
        self.entries.last().map(|(time, _)| *time)
    }

    /// Append a value at `time`; `time` must be after every stored time
    pub fn put_next_live_value(&mut self, time: Timestamp, value: V) -> Result<()> {
        if let Some(last) = self.last_key() {
            if time <= last {
                return Err(StrataError::InvariantViolation(format!(
                    "Live value at {} of {:?} is not after the last live value at {}",
                    time, self.segmented_key.key, last
                )));
            }
        }
        if !self.segment().contains(time) {
            return Err(StrataError::InvariantViolation(format!(
                "Live value at {} lies outside live segment {}",
                time, self.segmented_key
            )));
        }
        if let Some(journal) = &self.journal {
            journal.append(time, &value)?;
        }
        self.entries.push((time, value));
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&V> {
        self.entries.get(index).map(|(_, value)| value)
    }

    pub fn get_first_value(&self) -> Option<&V> {
        self.get(0)
    }

    pub fn get_last_value(&self) -> Option<&V> {
        self.entries.last().map(|(_, value)| value)
    }

    /// Index of the last value with time `<= t`
    pub fn floor_index(&self, t: Timestamp) -> Option<usize> {
        self.entries.partition_point(|(time, _)| *time <= t).checked_sub(1)
    }

    /// Index of the first value with time `>= t`
    pub fn ceil_index(&self, t: Timestamp) -> Option<usize> {
        let index = self.entries.partition_point(|(time, _)| *time < t);
        (index < self.entries.len()).then_some(index)
    }

    /// Largest time `<= t`, else the first value
    pub fn get_latest_value(&self, t: Timestamp) -> Option<&V> {
        match self.floor_index(t) {
            Some(index) => self.get(index),
            None => self.get_first_value(),
        }
    }

    /// The `n`-th value after the first value at or after `t`, clamped to
    /// the last value
    pub fn get_next_value(&self, t: Timestamp, n: u64) -> Option<&V> {
        let anchor = match self.ceil_index(t) {
            Some(anchor) => anchor,
            None => return self.get_last_value(),
        };
        match self.shift_forward(anchor, n) {
            Shifted::Found(index) => self.get(index),
            Shifted::Exhausted { .. } => self.get_last_value(),
        }
    }

    /// The `n`-th value before the last value at or before `t`, clamped to
    /// the first value
    pub fn get_previous_value(&self, t: Timestamp, n: u64) -> Option<&V> {
        let anchor = match self.floor_index(t) {
            Some(anchor) => anchor,
            None => return self.get_first_value(),
        };
        match self.shift_back(anchor, n) {
            Shifted::Found(index) => self.get(index),
            Shifted::Exhausted { .. } => self.get_first_value(),
        }
    }

    pub(crate) fn shift_back(&self, anchor: usize, n: u64) -> Shifted<usize> {
        match u64::try_from(anchor).ok().and_then(|a| a.checked_sub(n)) {
            Some(index) => Shifted::Found(index as usize),
            None => Shifted::Exhausted {
                remaining: n - anchor as u64,
            },
        }
    }

    pub(crate) fn shift_forward(&self, anchor: usize, n: u64) -> Shifted<usize> {
        let last = self.entries.len() as u64 - 1;
        let target = (anchor as u64).saturating_add(n);
        if target <= last {
            Shifted::Found(target as usize)
        } else {
            Shifted::Exhausted {
                remaining: target - last,
            }
        }
    }

    /// Indices of values with `from <= time <= to`, ascending
    pub fn range_indices(&self, from: Timestamp, to: Timestamp) -> Range<usize> {
        if from > to {
            return 0..0;
        }
        let start = self.entries.partition_point(|(time, _)| *time < from);
        let end = self.entries.partition_point(|(time, _)| *time <= to);
        start..end.max(start)
    }

    /// Values with `from <= time <= to`, ascending
    pub fn range_values(&self, from: Timestamp, to: Timestamp) -> impl Iterator<Item = &V> + '_ {
        self.entries[self.range_indices(from, to)]
            .iter()
            .map(|(_, value)| value)
    }

    /// Values with `to <= time <= from`, descending
    pub fn range_values_reverse(&self, from: Timestamp, to: Timestamp) -> impl Iterator<Item = &V> + '_ {
        self.entries[self.range_indices(to, from)]
            .iter()
            .rev()
            .map(|(_, value)| value)
    }

    /// Seal this segment into the historical table. The table must not
    /// already hold the segment.
    pub fn convert_to_historical(&self, table: &HistoricalSegmentTable<K, V>) -> Result<()> {
        let segment = self.segment();
        let initialized = table.maybe_init_segment(&self.segmented_key, || {
            self.range_values(segment.from, segment.to).cloned()
        })?;
        if !initialized {
            return Err(StrataError::InvariantViolation(format!(
                "Live segment {} was already historical",
                self.segmented_key
            )));
        }
        if let Some(journal) = &self.journal {
            journal.clear()?;
        }
        info!(
            "Converted live segment {} ({} values) to historical",
            self.segmented_key,
            self.entries.len()
        );
        Ok(())
    }

    /// Drop the journal of this segment
    pub fn discard(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.clear(),
            None => Ok(()),
        }
    }
}
