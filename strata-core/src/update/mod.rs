//! Bulk loader
//!
//! An update drains a source sequence into new chunks of one key:
//!
//! 1. the update-in-progress marker is created (an existing marker means an
//!    earlier update crashed and fails with [`StrataError::IncompleteUpdate`])
//! 2. values already stored (`end_time <=` the last stored end time) are
//!    skipped, everything else is checked for ordering
//! 3. values are cut into batches that never span a segment boundary
//! 4. batches are encoded and appended in order by one of the
//!    [`WriteStrategy`] implementations
//! 5. the marker is removed
//!
//! Any error leaves the marker in place.

mod parallel;
mod sequential;
mod sink;

use crate::chunk::{encode_chunk, ChunkMeta, CompressionKind, Compressor, EncodedChunk, ValueSerializer};
use crate::segment::{HistoricalSegmentTable, SegmentFinder};
use crate::{Result, SeriesKey, StrataError, TimeRange, TimeSeriesValue, Timestamp};
use sink::ChunkSink;
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// How encoded batches reach the segment files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Encode and append on the calling thread
    Sequential,
    /// Encode on `workers` threads through temporary files; one writer
    /// thread appends in batch order
    Parallel { workers: usize },
}

impl Default for WriteStrategy {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        WriteStrategy::Parallel { workers }
    }
}

/// Settings of the write path
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Chunk compression
    pub compression: CompressionKind,
    /// Values per chunk
    pub batch_size: usize,
    /// Size at which a segment rolls over to a new physical file
    pub max_mapped_file_size: u64,
    /// Segments whose files stay mapped between reads
    pub max_open_segments: usize,
    /// Re-batch a partially filled tail chunk when appending to its segment
    pub redo_last_chunk: bool,
    /// Encoding strategy of bulk updates
    pub strategy: WriteStrategy,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: CompressionKind::default(),
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            max_mapped_file_size: crate::config::MAX_MAPPED_FILE_SIZE,
            max_open_segments: crate::config::DEFAULT_MAX_OPEN_SEGMENTS,
            redo_last_chunk: true,
            strategy: WriteStrategy::default(),
        }
    }
}

/// Running totals of one update, passed to every flush callback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateProgress {
    pub min_time: Option<Timestamp>,
    pub max_time: Option<Timestamp>,
    /// Values written so far, including re-batched tail values
    pub value_count: u64,
    pub chunk_count: u64,
}

/// Result of a completed update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// New values stored
    pub value_count: u64,
    /// Chunks written
    pub chunk_count: u64,
    /// End time of the first new value
    pub min_time: Option<Timestamp>,
    /// End time of the last new value
    pub max_time: Option<Timestamp>,
    /// Values skipped because they were already stored
    pub skipped: u64,
}

/// Progress callback, invoked once per written chunk
pub trait UpdateListener: Send {
    fn on_flush(&mut self, chunk: &ChunkMeta, progress: &UpdateProgress);
}

impl UpdateListener for () {
    fn on_flush(&mut self, _chunk: &ChunkMeta, _progress: &UpdateProgress) {}
}

/// Listener calling a closure
pub struct OnFlush<F>(pub F);

impl<F> UpdateListener for OnFlush<F>
where
    F: FnMut(&ChunkMeta, &UpdateProgress) + Send,
{
    fn on_flush(&mut self, chunk: &ChunkMeta, progress: &UpdateProgress) {
        (self.0)(chunk, progress)
    }
}

/// Values of one segment handed to the encoder
pub(crate) struct Batch<V> {
    pub seq: u64,
    pub segment: TimeRange,
    pub values: Vec<V>,
}

/// Where the bytes of an encoded batch are held
pub(crate) enum Payload {
    Memory(bytes::Bytes),
    TempFile { path: PathBuf, len: u64 },
}

/// An encoded batch waiting to be appended
pub(crate) struct EncodedBatch {
    pub seq: u64,
    pub segment: TimeRange,
    pub value_count: u64,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub first_value: Vec<u8>,
    pub last_value: Vec<u8>,
    pub payload: Payload,
}

pub(crate) fn encode_batch<V: TimeSeriesValue>(
    batch: &Batch<V>,
    serializer: &dyn ValueSerializer<V>,
    compressor: &dyn Compressor,
) -> Result<(EncodedChunk, Vec<u8>, Vec<u8>)> {
    let chunk = encode_chunk(&batch.values, serializer, compressor)?;
    let (first, last) = match (batch.values.first(), batch.values.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(StrataError::Internal("Empty batch".into())),
    };
    Ok((chunk, serializer.to_bytes(first)?, serializer.to_bytes(last)?))
}

/// Counters of the producer side
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ProducerStats {
    pub accepted: u64,
    pub skipped: u64,
    pub min_time: Option<Timestamp>,
    pub max_time: Option<Timestamp>,
}

/// Which segments an update may write
pub(crate) enum Target<'a, K> {
    /// Any segment of the key, as cut by the finder, below the live segment
    Key {
        finder: &'a dyn SegmentFinder<K>,
        live_from: Option<Timestamp>,
    },
    /// Exactly one segment
    Segment(TimeRange),
}

/// Cuts the source into per-segment batches
pub(crate) struct BatchProducer<'a, K, V> {
    table: &'a HistoricalSegmentTable<K, V>,
    key: &'a K,
    target: Target<'a, K>,
    batch_size: usize,
    redo_last_chunk: bool,
    update_from: Option<Timestamp>,
    prev_end: Option<Timestamp>,
    stored_tail: Option<TimeRange>,
    current: Option<TimeRange>,
    buffer: Vec<V>,
    next_seq: u64,
    stats: ProducerStats,
}

impl<'a, K: SeriesKey, V: TimeSeriesValue> BatchProducer<'a, K, V> {
    fn new(table: &'a HistoricalSegmentTable<K, V>, key: &'a K, target: Target<'a, K>) -> Result<Self> {
        let tail = table.last_segment(key)?;
        let options = table.options();
        Ok(Self {
            table,
            key,
            target,
            batch_size: options.batch_size.max(1),
            redo_last_chunk: options.redo_last_chunk,
            update_from: tail.as_ref().map(|s| s.last_time),
            prev_end: tail.as_ref().map(|s| s.last_time),
            stored_tail: tail.map(|s| s.range),
            current: None,
            buffer: Vec::new(),
            next_seq: 0,
            stats: ProducerStats::default(),
        })
    }

    pub(crate) fn key(&self) -> &'a K {
        self.key
    }

    /// Drain `source`, handing every full batch (and the final partial one)
    /// to `emit` in order
    pub(crate) fn produce<I, F>(&mut self, source: I, mut emit: F) -> Result<ProducerStats>
    where
        I: IntoIterator<Item = V>,
        F: FnMut(Batch<V>) -> Result<()>,
    {
        for value in source {
            let start = value.start_time();
            let end = value.end_time();
            if self.update_from.map_or(false, |from| end <= from) {
                self.stats.skipped += 1;
                continue;
            }
            if end < start {
                return Err(StrataError::InvariantViolation(format!(
                    "Value of {:?} ends at {} before it starts at {}",
                    self.key, end, start
                )));
            }
            if let Some(prev) = self.prev_end {
                if start < prev {
                    return Err(StrataError::InvariantViolation(format!(
                        "Value of {:?} starting at {} overlaps previous value ending at {}",
                        self.key, start, prev
                    )));
                }
            }

            let segment = self.segment_for(end)?;
            if self.current != Some(segment) {
                self.switch_segment(segment, &mut emit)?;
            }

            self.prev_end = Some(end);
            self.stats.min_time.get_or_insert(end);
            self.stats.max_time = Some(end);
            self.stats.accepted += 1;
            self.buffer.push(value);
            if self.buffer.len() >= self.batch_size {
                self.emit_buffer(&mut emit)?;
            }
        }
        self.emit_buffer(&mut emit)?;
        Ok(self.stats)
    }

    fn segment_for(&self, end: Timestamp) -> Result<TimeRange> {
        match &self.target {
            Target::Segment(range) if range.contains(end) => Ok(*range),
            Target::Segment(range) => Err(StrataError::InvariantViolation(format!(
                "Value at {} of {:?} lies outside segment {}",
                end, self.key, range
            ))),
            Target::Key { finder, live_from } => {
                if let Some(live_from) = live_from {
                    if end >= *live_from {
                        return Err(StrataError::InvariantViolation(format!(
                            "Bulk value at {} of {:?} reaches into the live segment starting at {}",
                            end, self.key, live_from
                        )));
                    }
                }
                let segment = finder.segment_of(self.key, end);
                if !segment.contains(end) {
                    return Err(StrataError::InvariantViolation(format!(
                        "Segment finder placed {} in {}",
                        end, segment
                    )));
                }
                Ok(segment)
            }
        }
    }

    fn switch_segment<F>(&mut self, segment: TimeRange, emit: &mut F) -> Result<()>
    where
        F: FnMut(Batch<V>) -> Result<()>,
    {
        self.emit_buffer(emit)?;

        if let Some(current) = self.current {
            if segment.from <= current.to {
                return Err(StrataError::InvariantViolation(format!(
                    "Segment {} of {:?} overlaps segment {}",
                    segment, self.key, current
                )));
            }
        }
        if let Some(tail) = self.stored_tail {
            if segment == tail {
                if self.redo_last_chunk {
                    self.buffer = self.table.take_tail_chunk(self.key, tail)?;
                }
            } else if segment.from <= tail.to {
                return Err(StrataError::InvariantViolation(format!(
                    "Segment {} of {:?} overlaps stored segment {}",
                    segment, self.key, tail
                )));
            }
        }

        self.current = Some(segment);
        Ok(())
    }

    fn emit_buffer<F>(&mut self, emit: &mut F) -> Result<()>
    where
        F: FnMut(Batch<V>) -> Result<()>,
    {
        let segment = match self.current {
            Some(segment) if !self.buffer.is_empty() => segment,
            _ => return Ok(()),
        };
        let values = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let batch = Batch {
            seq: self.next_seq,
            segment,
            values,
        };
        self.next_seq += 1;
        emit(batch)
    }
}

/// Bulk loader of one key
pub struct TimeSeriesUpdater<'a, K, V> {
    table: &'a HistoricalSegmentTable<K, V>,
    key: &'a K,
    strategy: WriteStrategy,
}

impl<'a, K: SeriesKey, V: TimeSeriesValue> TimeSeriesUpdater<'a, K, V> {
    pub fn new(table: &'a HistoricalSegmentTable<K, V>, key: &'a K) -> Self {
        Self {
            table,
            key,
            strategy: table.options().strategy,
        }
    }

    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Append `source` to the key. The caller must hold the key's write lock.
    pub fn update<I, L>(
        &self,
        source: I,
        finder: &dyn SegmentFinder<K>,
        live_from: Option<Timestamp>,
        listener: &mut L,
    ) -> Result<UpdateSummary>
    where
        I: IntoIterator<Item = V>,
        L: UpdateListener,
    {
        self.run(source, Target::Key { finder, live_from }, self.strategy, listener)
    }

    /// Write `source` as the segment `range`
    pub(crate) fn init_segment<I>(&self, range: TimeRange, source: I) -> Result<UpdateSummary>
    where
        I: IntoIterator<Item = V>,
    {
        self.run(source, Target::Segment(range), WriteStrategy::Sequential, &mut ())
    }

    fn run<I, L>(
        &self,
        source: I,
        target: Target<'_, K>,
        strategy: WriteStrategy,
        listener: &mut L,
    ) -> Result<UpdateSummary>
    where
        I: IntoIterator<Item = V>,
        L: UpdateListener,
    {
        let marker = self.table.marker_path(self.key);
        if marker.exists() {
            return Err(StrataError::IncompleteUpdate {
                key: self.key.hash_key(),
            });
        }
        if let Some(dir) = marker.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::File::create(&marker)?;

        let mut producer = BatchProducer::new(self.table, self.key, target)?;
        let mut sink = ChunkSink::new(self.table, self.key, listener);
        let stats = match strategy {
            WriteStrategy::Sequential => sequential::write(self.table, &mut producer, source, &mut sink)?,
            WriteStrategy::Parallel { workers } => {
                parallel::write(self.table, &mut producer, source, &mut sink, workers.max(1))?
            }
        };
        let progress = sink.finish()?;

        fs::remove_file(&marker)?;

        let summary = UpdateSummary {
            value_count: stats.accepted,
            chunk_count: progress.chunk_count,
            min_time: stats.min_time,
            max_time: stats.max_time,
            skipped: stats.skipped,
        };
        if summary.value_count > 0 {
            info!(
                "Updated {:?}: {} values in {} chunks ({} skipped)",
                self.key, summary.value_count, summary.chunk_count, summary.skipped
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BincodeSerializer;
    use crate::kv::MemoryStore;
    use crate::segment::FixedSegmentFinder;
    use crate::MAX_TIME;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn table(dir: &TempDir, batch_size: usize, strategy: WriteStrategy) -> HistoricalSegmentTable<String, i64> {
        HistoricalSegmentTable::new(
            dir.path().join("segments"),
            Arc::new(MemoryStore::new()),
            Arc::new(BincodeSerializer::<i64>::new()),
            WriteOptions {
                batch_size,
                strategy,
                ..Default::default()
            },
        )
    }

    fn stored(table: &HistoricalSegmentTable<String, i64>, key: &String) -> Vec<i64> {
        table
            .range_values(key, i64::MIN, MAX_TIME)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_update_counts_chunks_and_flushes() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, 10, WriteStrategy::Sequential);
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(1_000);

        let mut flushes = Vec::new();
        let mut listener = OnFlush(|meta: &ChunkMeta, progress: &UpdateProgress| {
            flushes.push((meta.value_count, progress.chunk_count));
        });
        let summary = TimeSeriesUpdater::new(&table, &key)
            .update(0..95i64, &finder, None, &mut listener)
            .unwrap();

        assert_eq!(summary.value_count, 95);
        assert_eq!(summary.chunk_count, 10);
        assert_eq!(summary.min_time, Some(0));
        assert_eq!(summary.max_time, Some(94));
        assert_eq!(flushes.len(), 10);
        assert_eq!(flushes[9], (5, 10));
        assert_eq!(stored(&table, &key), (0..95).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_never_span_segments() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, 8, WriteStrategy::Sequential);
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(10);

        TimeSeriesUpdater::new(&table, &key)
            .update(0..25i64, &finder, None, &mut ())
            .unwrap();

        let segments = table.segments(&key).unwrap();
        let counts: Vec<u64> = segments.iter().map(|s| s.value_count).collect();
        assert_eq!(counts, vec![10, 10, 5]);
        assert_eq!(table.chunks(&key, 0).unwrap().len(), 2);
        assert_eq!(segments[1].range, TimeRange::new(10, 19));
    }

    #[test]
    fn test_reupdate_skips_stored_values() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, 4, WriteStrategy::Sequential);
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(100);
        let updater = TimeSeriesUpdater::new(&table, &key);

        updater.update(0..10i64, &finder, None, &mut ()).unwrap();
        let summary = updater.update(5..15i64, &finder, None, &mut ()).unwrap();

        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.value_count, 5);
        assert_eq!(stored(&table, &key), (0..15).collect::<Vec<_>>());
        // The two-value tail chunk was re-batched: 4 + 4 + 4 + 3
        let counts: Vec<u64> = table.chunks(&key, 0).unwrap().iter().map(|c| c.value_count).collect();
        assert_eq!(counts, vec![4, 4, 4, 3]);
    }

    #[test]
    fn test_without_redo_tail_chunk_stays() {
        let dir = TempDir::new().unwrap();
        let table = HistoricalSegmentTable::<String, i64>::new(
            dir.path().join("segments"),
            Arc::new(MemoryStore::new()),
            Arc::new(BincodeSerializer::<i64>::new()),
            WriteOptions {
                batch_size: 4,
                redo_last_chunk: false,
                strategy: WriteStrategy::Sequential,
                ..Default::default()
            },
        );
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(100);
        let updater = TimeSeriesUpdater::new(&table, &key);

        updater.update(0..6i64, &finder, None, &mut ()).unwrap();
        updater.update(6..8i64, &finder, None, &mut ()).unwrap();

        let counts: Vec<u64> = table.chunks(&key, 0).unwrap().iter().map(|c| c.value_count).collect();
        assert_eq!(counts, vec![4, 2, 2]);
        assert_eq!(stored(&table, &key), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_source_is_noop() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, 4, WriteStrategy::Parallel { workers: 2 });
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(100);

        let summary = TimeSeriesUpdater::new(&table, &key)
            .update(Vec::<i64>::new(), &finder, None, &mut ())
            .unwrap();
        assert_eq!(summary, UpdateSummary::default());
        assert!(table.segments(&key).unwrap().is_empty());
        assert!(!table.marker_path(&key).exists());
    }

    #[test]
    fn test_out_of_order_value_leaves_marker() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, 4, WriteStrategy::Sequential);
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(100);
        let updater = TimeSeriesUpdater::new(&table, &key);

        let err = updater
            .update(vec![1i64, 2, 7, 3], &finder, None, &mut ())
            .unwrap_err();
        assert!(matches!(err, StrataError::InvariantViolation(_)));
        assert!(table.marker_path(&key).exists());

        let err = updater.update(vec![10i64], &finder, None, &mut ()).unwrap_err();
        assert!(matches!(err, StrataError::IncompleteUpdate { .. }));
    }

    #[test]
    fn test_value_in_live_segment_rejected() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, 4, WriteStrategy::Sequential);
        let key = "k".to_string();
        let finder = FixedSegmentFinder::new(100);

        let err = TimeSeriesUpdater::new(&table, &key)
            .update(vec![50i64, 150], &finder, Some(100), &mut ())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
