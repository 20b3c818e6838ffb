//! Historical segment table
//!
//! Sealed segments of every key, each described by a [`SegmentSummary`] and
//! an ordered chunk index of [`ChunkMeta`] records kept in the metadata
//! store. Chunk indexes are loaded lazily and cached until the segment is
//! written again.
//!
//! Shift queries (`previous`/`next` by N values) walk the chunk indexes and
//! skip every chunk whose value count is smaller than the remaining shift,
//! so only the chunk holding the target value is decoded.

use super::files::{SegmentFiles, SegmentFilesCache};
use crate::chunk::{decode_chunk, ChunkMeta, ValueSerializer};
use crate::kv::{RangeStore, WriteBatch};
use crate::types::{fs_safe, Shifted};
use crate::update::{TimeSeriesUpdater, WriteOptions};
use crate::{
    Result, SegmentedKey, SeriesKey, StrataError, TimeRange, TimeSeriesValue, Timestamp, MAX_TIME,
    MIN_TIME,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the update-in-progress marker inside a key directory
pub const UPDATE_MARKER: &str = "updating";

/// Metadata of one sealed segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    /// Segment boundary
    pub range: TimeRange,
    /// Values stored in the segment
    pub value_count: u64,
    /// Chunks in the segment's index
    pub chunk_count: u64,
    /// End time of the first value
    pub first_time: Timestamp,
    /// End time of the last value
    pub last_time: Timestamp,
    /// Serialized first value
    pub first_value: Vec<u8>,
    /// Serialized last value
    pub last_value: Vec<u8>,
}

pub(crate) fn segment_hash(hash_key: &str) -> String {
    format!("seg/{}", hash_key)
}

pub(crate) fn chunk_hash(hash_key: &str, from: Timestamp) -> String {
    format!("chunk/{}/{}", hash_key, from)
}

/// Position of one stored value
#[derive(Debug, Clone, Copy)]
struct Cursor {
    segment: usize,
    chunk: usize,
    offset: u64,
}

/// Sealed segments of all keys of one table
pub struct HistoricalSegmentTable<K, V> {
    root: PathBuf,
    store: Arc<dyn RangeStore>,
    serializer: Arc<dyn ValueSerializer<V>>,
    options: WriteOptions,
    segments: Mutex<HashMap<String, Arc<Vec<SegmentSummary>>>>,
    chunk_indexes: Mutex<HashMap<(String, Timestamp), Arc<Vec<ChunkMeta>>>>,
    files: Mutex<SegmentFilesCache<(String, Timestamp)>>,
    _key: PhantomData<fn(&K)>,
}

impl<K: SeriesKey, V: TimeSeriesValue> HistoricalSegmentTable<K, V> {
    /// Create a table rooted at `root` (the `segments` directory)
    pub fn new(
        root: PathBuf,
        store: Arc<dyn RangeStore>,
        serializer: Arc<dyn ValueSerializer<V>>,
        options: WriteOptions,
    ) -> Self {
        let files = SegmentFilesCache::new(options.max_open_segments);
        Self {
            root,
            store,
            serializer,
            options,
            segments: Mutex::new(HashMap::new()),
            chunk_indexes: Mutex::new(HashMap::new()),
            files: Mutex::new(files),
            _key: PhantomData,
        }
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub(crate) fn store(&self) -> &Arc<dyn RangeStore> {
        &self.store
    }

    pub(crate) fn serializer(&self) -> &dyn ValueSerializer<V> {
        self.serializer.as_ref()
    }

    /// Directory holding every segment of `key`
    pub fn key_dir(&self, key: &K) -> PathBuf {
        self.root.join(fs_safe(&key.hash_key()))
    }

    /// Update-in-progress marker of `key`
    pub fn marker_path(&self, key: &K) -> PathBuf {
        self.key_dir(key).join(UPDATE_MARKER)
    }

    /// Directory of one segment
    pub fn segment_dir(&self, key: &K, range: TimeRange) -> PathBuf {
        self.key_dir(key).join(format!("{}_{}", range.from, range.to))
    }

    pub(crate) fn segment_files(&self, key: &K, range: TimeRange) -> Arc<SegmentFiles> {
        let cache_key = (key.hash_key(), range.from);
        self.files
            .lock()
            .get_or_open(cache_key, || SegmentFiles::new(self.segment_dir(key, range)))
    }

    /// Segments currently holding mapped files
    pub(crate) fn open_segment_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Summaries of all sealed segments of `key`, oldest first
    pub fn segments(&self, key: &K) -> Result<Arc<Vec<SegmentSummary>>> {
        let hash_key = key.hash_key();
        if let Some(segments) = self.segments.lock().get(&hash_key) {
            return Ok(segments.clone());
        }

        let mut segments = Vec::new();
        for (from, bytes) in self.store.range(&segment_hash(&hash_key), MIN_TIME, MAX_TIME)? {
            let summary: SegmentSummary = bincode::deserialize(&bytes).map_err(|e| {
                StrataError::Corruption(format!(
                    "Unreadable summary of segment {} of {}: {}",
                    from, hash_key, e
                ))
            })?;
            segments.push(summary);
        }

        let segments = Arc::new(segments);
        self.segments.lock().insert(hash_key, segments.clone());
        Ok(segments)
    }

    /// Summary of the segment starting at `from`
    pub fn segment(&self, key: &K, from: Timestamp) -> Result<Option<SegmentSummary>> {
        let segments = self.segments(key)?;
        Ok(segments.iter().find(|s| s.range.from == from).cloned())
    }

    /// Summary of the newest sealed segment
    pub fn last_segment(&self, key: &K) -> Result<Option<SegmentSummary>> {
        Ok(self.segments(key)?.last().cloned())
    }

    /// Chunk index of the segment starting at `from`, loaded on first use
    pub fn chunks(&self, key: &K, from: Timestamp) -> Result<Arc<Vec<ChunkMeta>>> {
        let cache_key = (key.hash_key(), from);
        if let Some(chunks) = self.chunk_indexes.lock().get(&cache_key) {
            return Ok(chunks.clone());
        }

        let entries = self.store.range(&chunk_hash(&cache_key.0, from), 0, MAX_TIME)?;
        let mut chunks = Vec::with_capacity(entries.len());
        for (ordinal, bytes) in entries {
            let meta: ChunkMeta = bincode::deserialize(&bytes).map_err(|e| {
                StrataError::Corruption(format!(
                    "Unreadable chunk {} of segment {} of {}: {}",
                    ordinal, from, cache_key.0, e
                ))
            })?;
            chunks.push(meta);
        }
        debug!(
            "Loaded chunk index of {} segment {}: {} chunks",
            cache_key.0,
            from,
            chunks.len()
        );

        let chunks = Arc::new(chunks);
        self.chunk_indexes.lock().insert(cache_key, chunks.clone());
        Ok(chunks)
    }

    /// True if `key` has no sealed data or its metadata cannot be read
    pub fn is_empty_or_inconsistent(&self, key: &K) -> bool {
        let segments = match self.segments(key) {
            Ok(segments) => segments,
            Err(_) => return true,
        };
        let last = match segments.last() {
            Some(last) => last,
            None => return true,
        };
        match self.chunks(key, last.range.from) {
            Ok(chunks) => chunks.len() as u64 != last.chunk_count || chunks.is_empty(),
            Err(_) => true,
        }
    }

    pub fn get_first_value(&self, key: &K) -> Result<Option<V>> {
        match self.segments(key)?.first() {
            Some(first) => Ok(Some(self.serializer.decode(&first.first_value)?)),
            None => Ok(None),
        }
    }

    pub fn get_last_value(&self, key: &K) -> Result<Option<V>> {
        match self.segments(key)?.last() {
            Some(last) => Ok(Some(self.serializer.decode(&last.last_value)?)),
            None => Ok(None),
        }
    }

    /// End time of the newest stored value
    pub fn last_time(&self, key: &K) -> Result<Option<Timestamp>> {
        Ok(self.segments(key)?.last().map(|s| s.last_time))
    }

    /// Last value with `end_time <= t`, else the first value
    pub fn get_latest_value(&self, key: &K, t: Timestamp) -> Result<Option<V>> {
        let segments = self.segments(key)?;
        match self.locate_floor(key, &segments, t)? {
            Some(cursor) => Ok(Some(self.value_at(key, &segments, cursor)?)),
            None => self.get_first_value(key),
        }
    }

    /// The value `n` positions before the last value with `end_time <= t`,
    /// clamped to the first value
    pub fn get_previous_value(&self, key: &K, t: Timestamp, n: u64) -> Result<Option<V>> {
        match self.shift_back_from(key, t, n)? {
            Some(Shifted::Found(value)) => Ok(Some(value)),
            _ => self.get_first_value(key),
        }
    }

    /// The value `n` positions after the first value with `end_time >= t`,
    /// clamped to the last value
    pub fn get_next_value(&self, key: &K, t: Timestamp, n: u64) -> Result<Option<V>> {
        match self.shift_forward_from(key, t, n)? {
            Some(Shifted::Found(value)) => Ok(Some(value)),
            _ => self.get_last_value(key),
        }
    }

    /// Shift back from the floor of `t`; `None` if no value is at or before `t`
    pub(crate) fn shift_back_from(&self, key: &K, t: Timestamp, n: u64) -> Result<Option<Shifted<V>>> {
        let segments = self.segments(key)?;
        match self.locate_floor(key, &segments, t)? {
            Some(cursor) => Ok(Some(self.walk_back(key, &segments, cursor, n)?)),
            None => Ok(None),
        }
    }

    /// Shift forward from the ceiling of `t`; `None` if no value is at or after `t`
    pub(crate) fn shift_forward_from(&self, key: &K, t: Timestamp, n: u64) -> Result<Option<Shifted<V>>> {
        let segments = self.segments(key)?;
        match self.locate_ceil(key, &segments, t)? {
            Some(cursor) => Ok(Some(self.walk_forward(key, &segments, cursor, n)?)),
            None => Ok(None),
        }
    }

    /// The value `n` positions before the last stored value
    pub(crate) fn nth_from_last(&self, key: &K, n: u64) -> Result<Shifted<V>> {
        let segments = self.segments(key)?;
        let segment = match segments.len().checked_sub(1) {
            Some(segment) => segment,
            None => {
                return Ok(Shifted::Exhausted {
                    remaining: n.saturating_add(1),
                })
            }
        };
        let chunks = self.chunks(key, segments[segment].range.from)?;
        let chunk = match chunks.last() {
            Some(last) => last,
            None => return Err(missing_chunks(key, &segments[segment])),
        };
        let cursor = Cursor {
            segment,
            chunk: chunks.len() - 1,
            offset: chunk.value_count - 1,
        };
        self.walk_back(key, &segments, cursor, n)
    }

    /// The value `n` positions after the first stored value
    pub(crate) fn nth_from_first(&self, key: &K, n: u64) -> Result<Shifted<V>> {
        let segments = self.segments(key)?;
        if segments.is_empty() {
            return Ok(Shifted::Exhausted {
                remaining: n.saturating_add(1),
            });
        }
        let cursor = Cursor {
            segment: 0,
            chunk: 0,
            offset: 0,
        };
        self.walk_forward(key, &segments, cursor, n)
    }

    fn locate_floor(&self, key: &K, segments: &[SegmentSummary], t: Timestamp) -> Result<Option<Cursor>> {
        let segment = match segments.partition_point(|s| s.first_time <= t).checked_sub(1) {
            Some(segment) => segment,
            None => return Ok(None),
        };
        let summary = &segments[segment];
        let chunks = self.chunks(key, summary.range.from)?;
        let chunk = chunks
            .partition_point(|c| c.min_time <= t)
            .checked_sub(1)
            .ok_or_else(|| missing_chunks(key, summary))?;

        let values = self.decode(key, summary.range, &chunks[chunk])?;
        let offset = values
            .partition_point(|v| v.end_time() <= t)
            .checked_sub(1)
            .ok_or_else(|| chunk_mismatch(key, summary, &chunks[chunk]))?;

        Ok(Some(Cursor {
            segment,
            chunk,
            offset: offset as u64,
        }))
    }

    fn locate_ceil(&self, key: &K, segments: &[SegmentSummary], t: Timestamp) -> Result<Option<Cursor>> {
        let segment = segments.partition_point(|s| s.last_time < t);
        if segment == segments.len() {
            return Ok(None);
        }
        let summary = &segments[segment];
        let chunks = self.chunks(key, summary.range.from)?;
        let chunk = chunks.partition_point(|c| c.max_time < t);
        if chunk == chunks.len() {
            return Err(missing_chunks(key, summary));
        }

        let values = self.decode(key, summary.range, &chunks[chunk])?;
        let offset = values.partition_point(|v| v.end_time() < t);
        if offset == values.len() {
            return Err(chunk_mismatch(key, summary, &chunks[chunk]));
        }

        Ok(Some(Cursor {
            segment,
            chunk,
            offset: offset as u64,
        }))
    }

    fn walk_back(&self, key: &K, segments: &[SegmentSummary], cursor: Cursor, n: u64) -> Result<Shifted<V>> {
        let mut segment = cursor.segment;
        let mut chunks = self.chunks(key, segments[segment].range.from)?;
        let mut chunk = cursor.chunk;

        if n <= cursor.offset {
            let target = Cursor {
                offset: cursor.offset - n,
                ..cursor
            };
            return self.value_at(key, segments, target).map(Shifted::Found);
        }

        // Steps left once positioned on the last value of the previous chunk
        let mut remaining = n - cursor.offset - 1;
        let mut skipped = 0u64;
        loop {
            if chunk == 0 {
                if segment == 0 {
                    return Ok(Shifted::Exhausted {
                        remaining: remaining.saturating_add(1),
                    });
                }
                segment -= 1;
                chunks = self.chunks(key, segments[segment].range.from)?;
                chunk = chunks
                    .len()
                    .checked_sub(1)
                    .ok_or_else(|| missing_chunks(key, &segments[segment]))?;
            } else {
                chunk -= 1;
            }

            let count = chunks[chunk].value_count;
            if remaining < count {
                debug!("Backward shift of {} skipped {} chunks", n, skipped);
                let target = Cursor {
                    segment,
                    chunk,
                    offset: count - 1 - remaining,
                };
                return self.value_at(key, segments, target).map(Shifted::Found);
            }
            remaining -= count;
            skipped += 1;
        }
    }

    fn walk_forward(&self, key: &K, segments: &[SegmentSummary], cursor: Cursor, n: u64) -> Result<Shifted<V>> {
        let mut segment = cursor.segment;
        let mut chunks = self.chunks(key, segments[segment].range.from)?;
        let mut chunk = cursor.chunk;

        let count = chunks
            .get(chunk)
            .ok_or_else(|| missing_chunks(key, &segments[segment]))?
            .value_count;
        let target_offset = cursor.offset.saturating_add(n);
        if target_offset < count {
            let target = Cursor {
                offset: target_offset,
                ..cursor
            };
            return self.value_at(key, segments, target).map(Shifted::Found);
        }

        // Steps left once positioned on the first value of the next chunk
        let mut remaining = target_offset - count;
        let mut skipped = 0u64;
        loop {
            if chunk + 1 == chunks.len() {
                if segment + 1 == segments.len() {
                    return Ok(Shifted::Exhausted {
                        remaining: remaining.saturating_add(1),
                    });
                }
                segment += 1;
                chunks = self.chunks(key, segments[segment].range.from)?;
                if chunks.is_empty() {
                    return Err(missing_chunks(key, &segments[segment]));
                }
                chunk = 0;
            } else {
                chunk += 1;
            }

            let count = chunks[chunk].value_count;
            if remaining < count {
                debug!("Forward shift of {} skipped {} chunks", n, skipped);
                let target = Cursor {
                    segment,
                    chunk,
                    offset: remaining,
                };
                return self.value_at(key, segments, target).map(Shifted::Found);
            }
            remaining -= count;
            skipped += 1;
        }
    }

    fn value_at(&self, key: &K, segments: &[SegmentSummary], cursor: Cursor) -> Result<V> {
        let summary = &segments[cursor.segment];
        let chunks = self.chunks(key, summary.range.from)?;
        let meta = chunks
            .get(cursor.chunk)
            .ok_or_else(|| missing_chunks(key, summary))?;
        let mut values = self.decode(key, summary.range, meta)?;
        if cursor.offset as usize >= values.len() {
            return Err(chunk_mismatch(key, summary, meta));
        }
        Ok(values.swap_remove(cursor.offset as usize))
    }

    /// Decode every value of one chunk
    pub(crate) fn decode(&self, key: &K, range: TimeRange, meta: &ChunkMeta) -> Result<Vec<V>> {
        let files = self.segment_files(key, range);
        let bytes = files.read(meta)?;
        let values = decode_chunk(&bytes, self.serializer.as_ref())?;
        if values.len() as u64 != meta.value_count {
            return Err(StrataError::Corruption(format!(
                "Chunk at {}:{} of {} holds {} values, index says {}",
                meta.file_index,
                meta.file_offset,
                key.hash_key(),
                values.len(),
                meta.value_count
            )));
        }
        Ok(values)
    }

    /// Values with `from <= end_time <= to`, ascending
    pub fn range_values(&self, key: &K, from: Timestamp, to: Timestamp) -> Result<HistoricalRange<V>> {
        self.plan_range(key, from, to, false)
    }

    /// Values with `to <= end_time <= from`, descending
    pub fn range_values_reverse(&self, key: &K, from: Timestamp, to: Timestamp) -> Result<HistoricalRange<V>> {
        self.plan_range(key, to, from, true)
    }

    fn plan_range(&self, key: &K, lo: Timestamp, hi: Timestamp, reverse: bool) -> Result<HistoricalRange<V>> {
        let mut plan = VecDeque::new();
        if lo <= hi {
            for summary in self.segments(key)?.iter() {
                if summary.last_time < lo || summary.first_time > hi {
                    continue;
                }
                let files = self.segment_files(key, summary.range);
                for meta in self.chunks(key, summary.range.from)?.iter() {
                    if meta.overlaps_time(lo, hi) {
                        plan.push_back((files.clone(), meta.clone()));
                    }
                }
            }
        }
        if reverse {
            plan.make_contiguous().reverse();
        }

        Ok(HistoricalRange {
            plan,
            serializer: self.serializer.clone(),
            lo,
            hi,
            reverse,
            buffer: Vec::new().into_iter(),
            done: false,
        })
    }

    /// Seal a segment from `source` unless it is already stored.
    ///
    /// Returns whether the segment was written by this call.
    pub fn maybe_init_segment<I, F>(&self, segmented_key: &SegmentedKey<K>, source: F) -> Result<bool>
    where
        I: IntoIterator<Item = V>,
        F: FnOnce() -> I,
    {
        let SegmentedKey { key, segment } = segmented_key;
        if self.segment(key, segment.from)?.is_some() {
            return Ok(false);
        }

        let summary = TimeSeriesUpdater::new(self, key).init_segment(*segment, source())?;
        info!(
            "Initialized segment {} with {} values in {} chunks",
            segmented_key, summary.value_count, summary.chunk_count
        );
        Ok(true)
    }

    /// Record one appended chunk together with the segment's new summary
    pub(crate) fn commit_chunk(
        &self,
        key: &K,
        summary: &SegmentSummary,
        ordinal: u64,
        meta: &ChunkMeta,
    ) -> Result<()> {
        let hash_key = key.hash_key();
        let mut batch = WriteBatch::new();
        batch.put(
            &chunk_hash(&hash_key, summary.range.from),
            ordinal as i64,
            bincode::serialize(meta)?,
        );
        batch.put(
            &segment_hash(&hash_key),
            summary.range.from,
            bincode::serialize(summary)?,
        );
        self.store.write_batch(batch)?;
        self.invalidate_segment(&hash_key, summary.range.from);
        Ok(())
    }

    /// Remove the tail chunk of a segment when it holds fewer than
    /// `batch_size` values, returning its values for re-batching.
    pub(crate) fn take_tail_chunk(&self, key: &K, range: TimeRange) -> Result<Vec<V>> {
        let summary = match self.segment(key, range.from)? {
            Some(summary) => summary,
            None => return Ok(Vec::new()),
        };
        let chunks = self.chunks(key, range.from)?;
        let tail = match chunks.last() {
            Some(tail) if (tail.value_count as usize) < self.options.batch_size => tail.clone(),
            _ => return Ok(Vec::new()),
        };

        let values = self.decode(key, range, &tail)?;
        let hash_key = key.hash_key();
        let ordinal = chunks.len() as i64 - 1;
        let mut batch = WriteBatch::new();
        batch.delete(&chunk_hash(&hash_key, range.from), ordinal);

        match chunks.len().checked_sub(2) {
            None => batch.delete(&segment_hash(&hash_key), range.from),
            Some(previous) => {
                let previous = &chunks[previous];
                let last = self
                    .decode(key, range, previous)?
                    .pop()
                    .ok_or_else(|| chunk_mismatch(key, &summary, previous))?;
                let trimmed = SegmentSummary {
                    value_count: summary.value_count - tail.value_count,
                    chunk_count: summary.chunk_count - 1,
                    last_time: last.end_time(),
                    last_value: self.serializer.to_bytes(&last)?,
                    ..summary
                };
                batch.put(&segment_hash(&hash_key), range.from, bincode::serialize(&trimmed)?);
            }
        }

        self.segment_files(key, range).truncate_to(&tail)?;
        self.store.write_batch(batch)?;
        self.invalidate_segment(&hash_key, range.from);
        debug!(
            "Reopened tail chunk of {} segment {} ({} values)",
            hash_key,
            range,
            values.len()
        );
        Ok(values)
    }

    /// Remove every sealed segment of `key`
    pub fn delete_range(&self, key: &K) -> Result<()> {
        let hash_key = key.hash_key();
        let segments = self.segments(key)?;

        let mut batch = WriteBatch::new();
        for summary in segments.iter() {
            batch.delete_range(&chunk_hash(&hash_key, summary.range.from));
        }
        batch.delete_range(&segment_hash(&hash_key));
        self.store.write_batch(batch)?;

        self.forget_key(&hash_key);
        let dir = self.key_dir(key);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!("Deleted {} historical segments of {}", segments.len(), hash_key);
        Ok(())
    }

    fn invalidate_segment(&self, hash_key: &str, from: Timestamp) {
        self.segments.lock().remove(hash_key);
        self.chunk_indexes.lock().remove(&(hash_key.to_string(), from));
    }

    fn forget_key(&self, hash_key: &str) {
        self.segments.lock().remove(hash_key);
        self.chunk_indexes.lock().retain(|(h, _), _| h != hash_key);
        self.files.lock().retain(|(h, _)| h != hash_key);
    }

    /// Drop every cached index and mapped file
    pub fn clear_caches(&self) {
        self.segments.lock().clear();
        self.chunk_indexes.lock().clear();
        self.files.lock().clear();
    }
}

fn missing_chunks<K: SeriesKey>(key: &K, summary: &SegmentSummary) -> StrataError {
    StrataError::Corruption(format!(
        "Chunk index of {} segment {} does not match its summary",
        key.hash_key(),
        summary.range
    ))
}

fn chunk_mismatch<K: SeriesKey>(key: &K, summary: &SegmentSummary, meta: &ChunkMeta) -> StrataError {
    StrataError::Corruption(format!(
        "Chunk [{}, {}] of {} segment {} does not match its index entry",
        meta.min_time,
        meta.max_time,
        key.hash_key(),
        summary.range
    ))
}

/// Lazy scan over the chunks of one key intersecting a time range.
///
/// Each chunk is decoded only when the scan reaches it; the decoded values
/// are owned by the iterator. A decoding failure is yielded once and ends
/// the scan.
pub struct HistoricalRange<V> {
    plan: VecDeque<(Arc<SegmentFiles>, ChunkMeta)>,
    serializer: Arc<dyn ValueSerializer<V>>,
    lo: Timestamp,
    hi: Timestamp,
    reverse: bool,
    buffer: std::vec::IntoIter<V>,
    done: bool,
}

impl<V: TimeSeriesValue> HistoricalRange<V> {
    /// A scan that yields nothing
    pub fn empty(serializer: Arc<dyn ValueSerializer<V>>) -> Self {
        Self {
            plan: VecDeque::new(),
            serializer,
            lo: 0,
            hi: -1,
            reverse: false,
            buffer: Vec::new().into_iter(),
            done: true,
        }
    }

    fn load(&self, files: &SegmentFiles, meta: &ChunkMeta) -> Result<Vec<V>> {
        let bytes = files.read(meta)?;
        let mut values = decode_chunk(&bytes, self.serializer.as_ref())?;

        let end = values.partition_point(|v| v.end_time() <= self.hi);
        values.truncate(end);
        let start = values.partition_point(|v| v.end_time() < self.lo);
        values.drain(..start);

        if self.reverse {
            values.reverse();
        }
        Ok(values)
    }
}

impl<V: TimeSeriesValue> Iterator for HistoricalRange<V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(value) = self.buffer.next() {
                return Some(Ok(value));
            }
            let (files, meta) = match self.plan.pop_front() {
                Some(next) => next,
                None => {
                    self.done = true;
                    return None;
                }
            };
            match self.load(&files, &meta) {
                Ok(values) => self.buffer = values.into_iter(),
                Err(e) => {
                    self.done = true;
                    self.plan.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}
