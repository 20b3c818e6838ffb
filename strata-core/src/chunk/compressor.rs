//! Block compressors for chunk payloads

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// A block-oriented compressor/decompressor pair
pub trait Compressor: Send + Sync {
    /// Tag written into every chunk header
    fn kind(&self) -> CompressionKind;

    /// Compress a whole payload
    fn compress(&self, raw: &[u8]) -> Vec<u8>;

    /// Decompress a payload whose uncompressed size is known
    fn decompress(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>>;
}

/// Compression codecs understood by the chunk format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum CompressionKind {
    /// Payload stored as-is
    None = 0,
    /// LZ4 block compression
    #[default]
    Lz4 = 1,
}

impl CompressionKind {
    /// The compressor implementing this codec
    pub fn compressor(self) -> &'static dyn Compressor {
        match self {
            CompressionKind::None => &NoCompression,
            CompressionKind::Lz4 => &Lz4Compressor,
        }
    }
}

impl TryFrom<u8> for CompressionKind {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Lz4),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid compression kind: {}",
                value
            ))),
        }
    }
}

/// Pass-through codec
pub struct NoCompression;

impl Compressor for NoCompression {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn compress(&self, raw: &[u8]) -> Vec<u8> {
        raw.to_vec()
    }

    fn decompress(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        if data.len() != raw_len {
            return Err(StrataError::Compression(format!(
                "Stored length {} does not match raw length {}",
                data.len(),
                raw_len
            )));
        }
        Ok(data.to_vec())
    }
}

/// LZ4 block codec from `lz4_flex`
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn compress(&self, raw: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress(raw)
    }

    fn decompress(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(data, raw_len)
            .map_err(|e| StrataError::Compression(e.to_string()))
    }
}
