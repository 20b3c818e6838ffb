//! Chunk codec
//!
//! A chunk is one flushed batch of values:
//! - values are serialized in arrival order through a [`ValueSerializer`]
//! - the payload goes through a pluggable block [`Compressor`]
//! - every chunk carries a CRC32 so corruption is detected, never skipped
//!
//! [`ChunkMeta`] records where a chunk lives and what it covers, which is
//! what lets readers skip whole chunks without decoding them.

mod codec;
mod compressor;

pub use codec::{decode_chunk, encode_chunk, ChunkHeader, EncodedChunk, CHUNK_FORMAT_VERSION};
pub use compressor::{CompressionKind, Compressor, Lz4Compressor, NoCompression};

use crate::{Result, StrataError, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Converts values to and from bytes
pub trait ValueSerializer<V>: Send + Sync {
    /// Append the encoded value to `buf`
    fn encode(&self, value: &V, buf: &mut Vec<u8>) -> Result<()>;

    /// Decode one value from exactly `bytes`
    fn decode(&self, bytes: &[u8]) -> Result<V>;

    /// Encode into a fresh buffer
    fn to_bytes(&self, value: &V) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(value, &mut buf)?;
        Ok(buf)
    }
}

/// Serializer for any serde type, backed by bincode
pub struct BincodeSerializer<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeSerializer<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BincodeSerializer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> ValueSerializer<V> for BincodeSerializer<V> {
    fn encode(&self, value: &V, buf: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(buf, value).map_err(|e| StrataError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes).map_err(|e| StrataError::Serialization(e.to_string()))
    }
}

/// Metadata of one chunk in a segment's chunk index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// End time of the first value
    pub min_time: Timestamp,
    /// End time of the last value
    pub max_time: Timestamp,
    /// Number of values in the chunk
    pub value_count: u64,
    /// Number of values in all earlier chunks of the segment
    pub preceding_value_count: u64,
    /// Physical file this chunk lives in
    pub file_index: u32,
    /// Offset inside that physical file
    pub file_offset: u64,
    /// Encoded length in bytes
    pub length: u64,
    /// Summed length of the earlier physical files of the segment
    pub preceding_memory_offset: u64,
}

impl ChunkMeta {
    /// Check if the chunk may contain values in the time range
    pub fn overlaps_time(&self, from: Timestamp, to: Timestamp) -> bool {
        self.min_time <= to && self.max_time >= from
    }

    /// Offset one past the last byte of this chunk within its file
    pub fn end_offset(&self) -> u64 {
        self.file_offset + self.length
    }
}
