//! Chunk encoding and decoding

use super::{CompressionKind, Compressor, ValueSerializer};
use crate::{Result, StrataError, TimeSeriesValue, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Chunk format version
pub const CHUNK_FORMAT_VERSION: u8 = 1;

/// Fixed chunk header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk format version
    pub version: u8,
    /// Codec of the stored payload
    pub compression: CompressionKind,
    /// Number of values
    pub value_count: u32,
    /// Uncompressed payload size
    pub raw_len: u32,
    /// Stored payload size
    pub stored_len: u32,
}

impl ChunkHeader {
    /// Header size in bytes
    pub const SIZE: usize = 14;

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.compression as u8);
        buf.put_u32_le(self.value_count);
        buf.put_u32_le(self.raw_len);
        buf.put_u32_le(self.stored_len);
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(StrataError::InvalidFormat("Chunk header too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let version = cursor.get_u8();
        if version != CHUNK_FORMAT_VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "Unsupported chunk version: {}",
                version
            )));
        }
        Ok(Self {
            version,
            compression: CompressionKind::try_from(cursor.get_u8())?,
            value_count: cursor.get_u32_le(),
            raw_len: cursor.get_u32_le(),
            stored_len: cursor.get_u32_le(),
        })
    }
}

/// A serialized chunk ready to be appended to a segment file
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Header, payload and checksum
    pub bytes: Bytes,
    /// Number of values
    pub value_count: u64,
    /// End time of the first value
    pub min_time: Timestamp,
    /// End time of the last value
    pub max_time: Timestamp,
}

/// Serialize a batch of values into one chunk.
///
/// Values are written in slice order; the batch must not be empty.
pub fn encode_chunk<V: TimeSeriesValue>(
    values: &[V],
    serializer: &dyn ValueSerializer<V>,
    compressor: &dyn Compressor,
) -> Result<EncodedChunk> {
    let (first, last) = match (values.first(), values.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(StrataError::Internal("Cannot encode an empty chunk".into())),
    };

    let mut raw = Vec::with_capacity(values.len() * 32);
    let mut scratch = Vec::new();
    for value in values {
        scratch.clear();
        serializer.encode(value, &mut scratch)?;
        raw.put_u32_le(frame_len(scratch.len(), "value")?);
        raw.put_slice(&scratch);
    }

    let stored = compressor.compress(&raw);
    let header = ChunkHeader {
        version: CHUNK_FORMAT_VERSION,
        compression: compressor.kind(),
        value_count: frame_len(values.len(), "value count")?,
        raw_len: frame_len(raw.len(), "payload")?,
        stored_len: frame_len(stored.len(), "compressed payload")?,
    };

    let mut buf = BytesMut::with_capacity(ChunkHeader::SIZE + stored.len() + 4);
    header.write_to(&mut buf);
    buf.put_slice(&stored);

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);

    Ok(EncodedChunk {
        bytes: buf.freeze(),
        value_count: values.len() as u64,
        min_time: first.end_time(),
        max_time: last.end_time(),
    })
}

/// Lengths are framed as u32
fn frame_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| StrataError::InvalidFormat(format!("Chunk {} length {} exceeds u32", what, len)))
}

/// Decode every value of a chunk, in stored order.
///
/// Any framing, checksum, decompression or deserialization error is returned;
/// a damaged chunk never yields a partial result.
pub fn decode_chunk<V>(data: &[u8], serializer: &dyn ValueSerializer<V>) -> Result<Vec<V>> {
    let header = ChunkHeader::from_bytes(data)?;

    let checksum_pos = ChunkHeader::SIZE + header.stored_len as usize;
    if checksum_pos + 4 != data.len() {
        return Err(StrataError::Corruption(format!(
            "Chunk length {} does not match header (expected {})",
            data.len(),
            checksum_pos + 4
        )));
    }

    let expected_checksum = {
        let mut c = std::io::Cursor::new(&data[checksum_pos..]);
        c.get_u32_le()
    };
    let actual_checksum = crc32fast::hash(&data[..checksum_pos]);
    if expected_checksum != actual_checksum {
        return Err(StrataError::ChecksumMismatch {
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    let stored = &data[ChunkHeader::SIZE..checksum_pos];
    let raw = header
        .compression
        .compressor()
        .decompress(stored, header.raw_len as usize)?;

    let mut values = Vec::with_capacity(header.value_count as usize);
    let mut cursor = std::io::Cursor::new(raw.as_slice());
    for _ in 0..header.value_count {
        if cursor.remaining() < 4 {
            return Err(StrataError::Corruption("Truncated chunk payload".into()));
        }
        let len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if pos + len > raw.len() {
            return Err(StrataError::Corruption("Value exceeds chunk payload".into()));
        }
        values.push(serializer.decode(&raw[pos..pos + len])?);
        cursor.set_position((pos + len) as u64);
    }

    if cursor.has_remaining() {
        return Err(StrataError::Corruption("Trailing bytes in chunk payload".into()));
    }

    Ok(values)
}
