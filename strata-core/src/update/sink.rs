//! Ordered append of encoded batches

use super::{EncodedBatch, Payload, UpdateListener, UpdateProgress};
use crate::chunk::ChunkMeta;
use crate::segment::{HistoricalSegmentTable, SegmentFileWriter, SegmentSummary};
use crate::{Result, SeriesKey, StrataError, TimeRange, TimeSeriesValue};
use std::fs::{self, File};
use tracing::debug;

struct OpenSegment {
    range: TimeRange,
    writer: SegmentFileWriter,
    summary: Option<SegmentSummary>,
    next_ordinal: u64,
    preceding_value_count: u64,
}

/// Appends encoded batches to their segment files and records their
/// metadata. Batches must arrive in sequence order.
pub(crate) struct ChunkSink<'a, K, V, L> {
    table: &'a HistoricalSegmentTable<K, V>,
    key: &'a K,
    listener: &'a mut L,
    open: Option<OpenSegment>,
    progress: UpdateProgress,
}

impl<'a, K: SeriesKey, V: TimeSeriesValue, L: UpdateListener> ChunkSink<'a, K, V, L> {
    pub(crate) fn new(table: &'a HistoricalSegmentTable<K, V>, key: &'a K, listener: &'a mut L) -> Self {
        Self {
            table,
            key,
            listener,
            open: None,
            progress: UpdateProgress::default(),
        }
    }

    pub(crate) fn write(&mut self, batch: EncodedBatch) -> Result<()> {
        if self.open.as_ref().map(|s| s.range) != Some(batch.segment) {
            self.close_segment()?;
            self.open = Some(self.open_segment(batch.segment)?);
        }
        let segment = self
            .open
            .as_mut()
            .ok_or_else(|| StrataError::Internal("No open segment".into()))?;

        let (placement, length) = match &batch.payload {
            Payload::Memory(bytes) => (segment.writer.append(bytes)?, bytes.len() as u64),
            Payload::TempFile { path, len } => {
                let mut file = File::open(path)?;
                let placement = segment.writer.append_from(&mut file, *len)?;
                drop(file);
                fs::remove_file(path)?;
                (placement, *len)
            }
        };
        segment.writer.flush()?;

        let meta = ChunkMeta {
            min_time: batch.min_time,
            max_time: batch.max_time,
            value_count: batch.value_count,
            preceding_value_count: segment.preceding_value_count,
            file_index: placement.file_index,
            file_offset: placement.file_offset,
            length,
            preceding_memory_offset: placement.preceding_memory_offset,
        };

        let summary = match segment.summary.take() {
            Some(summary) => SegmentSummary {
                value_count: summary.value_count + batch.value_count,
                chunk_count: summary.chunk_count + 1,
                last_time: batch.max_time,
                last_value: batch.last_value,
                ..summary
            },
            None => SegmentSummary {
                range: batch.segment,
                value_count: batch.value_count,
                chunk_count: 1,
                first_time: batch.min_time,
                last_time: batch.max_time,
                first_value: batch.first_value,
                last_value: batch.last_value,
            },
        };
        self.table
            .commit_chunk(self.key, &summary, segment.next_ordinal, &meta)?;
        segment.summary = Some(summary);
        segment.next_ordinal += 1;
        segment.preceding_value_count += batch.value_count;

        self.progress.min_time.get_or_insert(batch.min_time);
        self.progress.max_time = Some(batch.max_time);
        self.progress.value_count += batch.value_count;
        self.progress.chunk_count += 1;
        debug!(
            "Flushed chunk {} of {:?} segment {}: {} values at {}:{}",
            batch.seq, self.key, batch.segment, batch.value_count, meta.file_index, meta.file_offset
        );
        self.listener.on_flush(&meta, &self.progress);
        Ok(())
    }

    fn open_segment(&self, range: TimeRange) -> Result<OpenSegment> {
        let chunks = self.table.chunks(self.key, range.from)?;
        let summary = self.table.segment(self.key, range.from)?;
        if summary.as_ref().map_or(0, |s| s.chunk_count) != chunks.len() as u64 {
            return Err(StrataError::Corruption(format!(
                "Chunk index of {:?} segment {} does not match its summary",
                self.key, range
            )));
        }

        let tail = chunks.last();
        let writer = self
            .table
            .segment_files(self.key, range)
            .writer(tail, self.table.options().max_mapped_file_size)?;
        Ok(OpenSegment {
            range,
            writer,
            summary,
            next_ordinal: chunks.len() as u64,
            preceding_value_count: tail.map_or(0, |t| t.preceding_value_count + t.value_count),
        })
    }

    fn close_segment(&mut self) -> Result<()> {
        if let Some(segment) = self.open.take() {
            segment.writer.finish()?;
        }
        Ok(())
    }

    /// Sync the last segment and return the totals
    pub(crate) fn finish(mut self) -> Result<UpdateProgress> {
        self.close_segment()?;
        Ok(self.progress)
    }
}
