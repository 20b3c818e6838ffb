//! Multi-threaded write strategy
//!
//! ```text
//! caller thread          worker threads             writer thread
//! producer ──batches──▶ encode ─▶ tmp/<uuid>.chunk ──▶ reorder by seq ─▶ append
//! ```
//!
//! Both queues are bounded, so a slow disk throttles the producer. Only
//! encoding runs in parallel; the writer appends strictly in batch order, so
//! the segment files are identical to the sequential strategy's output.

use super::sink::ChunkSink;
use super::{encode_batch, Batch, BatchProducer, EncodedBatch, Payload, ProducerStats, UpdateListener};
use crate::chunk::{Compressor, ValueSerializer};
use crate::segment::HistoricalSegmentTable;
use crate::{Result, SeriesKey, StrataError, TimeSeriesValue};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue slots per worker
const QUEUE_DEPTH_PER_WORKER: usize = 2;

pub(crate) fn write<K, V, I, L>(
    table: &HistoricalSegmentTable<K, V>,
    producer: &mut BatchProducer<'_, K, V>,
    source: I,
    sink: &mut ChunkSink<'_, K, V, L>,
    workers: usize,
) -> Result<ProducerStats>
where
    K: SeriesKey,
    V: TimeSeriesValue,
    I: IntoIterator<Item = V>,
    L: UpdateListener,
{
    let serializer = table.serializer();
    let compressor = table.options().compression.compressor();
    let depth = workers * QUEUE_DEPTH_PER_WORKER;
    let key = producer.key();

    let (produced, written) = thread::scope(|scope| {
        let (batch_tx, batch_rx) = bounded::<Batch<V>>(depth);
        let (encoded_tx, encoded_rx) = bounded::<Result<EncodedBatch>>(depth);

        for _ in 0..workers {
            let batch_rx = batch_rx.clone();
            let encoded_tx = encoded_tx.clone();
            scope.spawn(move || encode_worker(table, key, serializer, compressor, batch_rx, encoded_tx));
        }
        drop(batch_rx);
        drop(encoded_tx);

        let writer = scope.spawn(move || append_in_order(sink, encoded_rx));

        let produced = producer.produce(source, |batch| {
            batch_tx
                .send(batch)
                .map_err(|_| StrataError::Internal("Chunk writer stopped".into()))
        });
        drop(batch_tx);

        let written = writer
            .join()
            .unwrap_or_else(|_| Err(StrataError::Internal("Chunk writer panicked".into())));
        (produced, written)
    });

    // A failed writer also stops the producer; its error is the cause
    written?;
    produced
}

fn encode_worker<K, V>(
    table: &HistoricalSegmentTable<K, V>,
    key: &K,
    serializer: &dyn ValueSerializer<V>,
    compressor: &dyn Compressor,
    batches: Receiver<Batch<V>>,
    encoded: Sender<Result<EncodedBatch>>,
) where
    K: SeriesKey,
    V: TimeSeriesValue,
{
    for batch in batches {
        let tmp_dir = table.segment_dir(key, batch.segment).join("tmp");
        let result = encode_to_file(&batch, serializer, compressor, tmp_dir);
        if encoded.send(result).is_err() {
            break;
        }
    }
}

fn encode_to_file<V: TimeSeriesValue>(
    batch: &Batch<V>,
    serializer: &dyn ValueSerializer<V>,
    compressor: &dyn Compressor,
    tmp_dir: PathBuf,
) -> Result<EncodedBatch> {
    let (chunk, first_value, last_value) = encode_batch(batch, serializer, compressor)?;

    fs::create_dir_all(&tmp_dir)?;
    let path = tmp_dir.join(format!("{}.chunk", Uuid::new_v4()));
    let mut file = File::create(&path)?;
    file.write_all(&chunk.bytes)?;
    file.flush()?;

    Ok(EncodedBatch {
        seq: batch.seq,
        segment: batch.segment,
        value_count: chunk.value_count,
        min_time: chunk.min_time,
        max_time: chunk.max_time,
        first_value,
        last_value,
        payload: Payload::TempFile {
            path,
            len: chunk.bytes.len() as u64,
        },
    })
}

fn append_in_order<K, V, L>(
    sink: &mut ChunkSink<'_, K, V, L>,
    encoded: Receiver<Result<EncodedBatch>>,
) -> Result<()>
where
    K: SeriesKey,
    V: TimeSeriesValue,
    L: UpdateListener,
{
    let mut pending = BTreeMap::new();
    let mut next_seq = 0u64;
    let mut tmp_dirs = Vec::new();

    for result in encoded {
        let batch = result?;
        pending.insert(batch.seq, batch);
        while let Some(batch) = pending.remove(&next_seq) {
            if let Payload::TempFile { path, .. } = &batch.payload {
                if let Some(dir) = path.parent() {
                    if !tmp_dirs.iter().any(|d: &PathBuf| d == dir) {
                        tmp_dirs.push(dir.to_path_buf());
                    }
                }
            }
            sink.write(batch)?;
            next_seq += 1;
        }
    }

    if !pending.is_empty() {
        return Err(StrataError::Internal(format!(
            "{} encoded batches never became appendable after batch {}",
            pending.len(),
            next_seq
        )));
    }

    for dir in tmp_dirs {
        if let Err(e) = fs::remove_dir(&dir) {
            warn!("Could not remove temp directory {:?}: {}", dir, e);
        }
    }
    debug!("Appended {} batches in order", next_seq);
    Ok(())
}
