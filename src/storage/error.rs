//! Storage layer error types
//!
//! Defines all errors that can occur in the storage and recovery layer.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (checksum mismatch, bad header, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Series file format error (bad size, unreadable record)
    #[error("Invalid series file: {0}")]
    InvalidSeriesFile(String),

    /// Archive or label index backend failed
    #[error("Index error: {0}")]
    Index(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
