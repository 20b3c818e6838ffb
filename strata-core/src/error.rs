//! Error types for Strata

use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Value or metadata (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource is still in use; the caller may try again later
    #[error("Retry later: {0}")]
    Retryable(String),

    /// A bulk update was interrupted; the key must be rebuilt
    #[error("Incomplete update for key {key}: delete and rebuild its data")]
    IncompleteUpdate { key: String },

    /// Ordering or segment invariant broken by the caller
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Table has been closed
    #[error("Table closed: {0}")]
    Closed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            StrataError::Retryable(_) => true,
            StrataError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_)
                | StrataError::ChecksumMismatch { .. }
                | StrataError::InvalidFormat(_)
        )
    }

    /// Faults that must halt the calling workflow instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::IncompleteUpdate { .. } | StrataError::InvariantViolation(_)
        )
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}
