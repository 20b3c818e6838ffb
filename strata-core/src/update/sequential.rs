//! Single-threaded write strategy

use super::sink::ChunkSink;
use super::{encode_batch, BatchProducer, EncodedBatch, Payload, ProducerStats, UpdateListener};
use crate::segment::HistoricalSegmentTable;
use crate::{Result, SeriesKey, TimeSeriesValue};

/// Encode every batch and append it right away, in arrival order
pub(crate) fn write<K, V, I, L>(
    table: &HistoricalSegmentTable<K, V>,
    producer: &mut BatchProducer<'_, K, V>,
    source: I,
    sink: &mut ChunkSink<'_, K, V, L>,
) -> Result<ProducerStats>
where
    K: SeriesKey,
    V: TimeSeriesValue,
    I: IntoIterator<Item = V>,
    L: UpdateListener,
{
    let compressor = table.options().compression.compressor();
    producer.produce(source, |batch| {
        let (chunk, first_value, last_value) = encode_batch(&batch, table.serializer(), compressor)?;
        sink.write(EncodedBatch {
            seq: batch.seq,
            segment: batch.segment,
            value_count: chunk.value_count,
            min_time: chunk.min_time,
            max_time: chunk.max_time,
            first_value,
            last_value,
            payload: Payload::Memory(chunk.bytes),
        })
    })
}
