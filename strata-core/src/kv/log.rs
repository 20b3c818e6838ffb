//! Log-backed ordered store
//!
//! Every write batch is appended to a log file as one framed record:
//!
//! - 4 bytes: record length (excluding this field)
//! - N bytes: bincode-encoded batch
//! - 4 bytes: CRC32 of the batch bytes
//!
//! The log is replayed into a [`MemoryStore`] on open. A torn record at the
//! end of the log (crash during write) is truncated; a damaged record in the
//! middle is reported as corruption.

use super::{MemoryStore, RangeStore, WriteBatch};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Replayed records beyond this many per live entry trigger a rewrite
const COMPACTION_RATIO: usize = 2;
const COMPACTION_MIN_RECORDS: usize = 1024;

/// Ordered store persisted in an append-only log
pub struct LogStore {
    path: PathBuf,
    state: MemoryStore,
    writer: Mutex<LogWriter>,
}

struct LogWriter {
    file: BufWriter<File>,
    records: usize,
}

enum Frame {
    Record(WriteBatch, usize),
    Incomplete,
}

impl LogStore {
    /// Open (or create) the log at `path` and replay it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = MemoryStore::new();

        let records = if path.exists() {
            Self::replay(&path, &state)?
        } else {
            0
        };

        let mut store = Self {
            writer: Mutex::new(LogWriter {
                file: BufWriter::new(Self::open_append(&path)?),
                records,
            }),
            path,
            state,
        };

        if records > COMPACTION_MIN_RECORDS && records > store.state.len() * COMPACTION_RATIO {
            store.compact()?;
        }

        Ok(store)
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StrataError::Io)
    }

    fn replay(path: &Path, state: &MemoryStore) -> Result<usize> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut offset = 0;
        let mut records = 0;
        while offset < data.len() {
            match decode_frame(&data[offset..]) {
                Ok(Frame::Record(batch, consumed)) => {
                    state.apply(&batch);
                    offset += consumed;
                    records += 1;
                }
                Ok(Frame::Incomplete) => {
                    warn!(
                        "Incomplete record at offset {} in {:?}, truncating",
                        offset, path
                    );
                    Self::truncate(path, offset)?;
                    break;
                }
                Err(StrataError::ChecksumMismatch { expected, actual })
                    if frame_end(&data[offset..]) == Some(data.len() - offset) =>
                {
                    warn!(
                        "Checksum mismatch in last record at offset {} in {:?} (expected {}, got {}), truncating",
                        offset, path, expected, actual
                    );
                    Self::truncate(path, offset)?;
                    break;
                }
                Err(StrataError::ChecksumMismatch { .. }) => {
                    return Err(StrataError::Corruption(format!(
                        "Checksum mismatch at offset {} in {:?}",
                        offset, path
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Replayed {} records from {:?}", records, path);
        Ok(records)
    }

    fn truncate(path: &Path, len: usize) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the log so it only contains live entries
    fn compact(&mut self) -> Result<()> {
        let snapshot = self.state.snapshot();
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            if !snapshot.is_empty() {
                tmp.write_all(&encode_frame(&snapshot)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let mut writer = self.writer.lock();
        let before = writer.records;
        writer.file = BufWriter::new(Self::open_append(&self.path)?);
        writer.records = usize::from(!snapshot.is_empty());
        info!(
            "Compacted {:?}: {} records -> {} entries",
            self.path,
            before,
            snapshot.len()
        );
        Ok(())
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeStore for LogStore {
    fn get(&self, hash_key: &str, range_key: i64) -> Result<Option<Vec<u8>>> {
        self.state.get(hash_key, range_key)
    }

    fn range(&self, hash_key: &str, from: i64, to: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        self.state.range(hash_key, from, to)
    }

    fn hash_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.state.hash_keys(prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&batch)?;

        // Applied under the writer lock so memory follows log order
        let mut writer = self.writer.lock();
        writer.file.write_all(&frame)?;
        writer.file.flush()?;
        writer.records += 1;
        self.state.apply(&batch);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        Ok(())
    }
}

fn encode_frame(batch: &WriteBatch) -> Result<Bytes> {
    let payload = bincode::serialize(batch)?;

    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32_le((payload.len() + 4) as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));
    Ok(buf.freeze())
}

/// Total frame size if the length prefix is readable and fits in `data`
fn frame_end(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    let len = std::io::Cursor::new(data).get_u32_le() as usize;
    (data.len() >= 4 + len).then_some(4 + len)
}

fn decode_frame(data: &[u8]) -> Result<Frame> {
    let total = match frame_end(data) {
        Some(total) => total,
        None => return Ok(Frame::Incomplete),
    };
    if total < 8 {
        return Err(StrataError::Corruption(format!("Invalid record length {}", total - 4)));
    }

    let payload = &data[4..total - 4];
    let expected = std::io::Cursor::new(&data[total - 4..total]).get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(StrataError::ChecksumMismatch { expected, actual });
    }

    let batch: WriteBatch = bincode::deserialize(payload)
        .map_err(|e| StrataError::Corruption(format!("Undecodable record: {}", e)))?;
    Ok(Frame::Record(batch, total))
}
