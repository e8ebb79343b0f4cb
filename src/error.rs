//! Error types for eventlog
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::types::{ExpectedVersion, StreamHead};

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for eventlog operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt record at position {position}: {reason}")]
    CorruptRecord { position: i64, reason: String },

    #[error("Checksum mismatch at position {position}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        position: i64,
        expected: u32,
        actual: u32,
    },

    #[error("No record at log position {0}")]
    RecordNotFound(i64),

    #[error("Writer halted: {0}")]
    WriterHalted(String),

    // -------------------------------------------------------------------------
    // Stream Errors
    // -------------------------------------------------------------------------
    #[error("Wrong expected version for stream '{stream}': expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
        actual: StreamHead,
    },

    #[error("Stream '{0}' is deleted")]
    StreamDeleted(String),

    #[error("Access denied to stream '{0}'")]
    AccessDenied(String),

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Index error: {0}")]
    Index(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Caller / Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Safe to retry: appends are keyed on event ids, so a retried write
    /// after a timeout cannot produce a duplicate commit.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }

    /// The process cannot keep accepting writes after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptRecord { .. }
                | StoreError::ChecksumMismatch { .. }
                | StoreError::WriterHalted(_)
        )
    }
}
