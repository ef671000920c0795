//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer, plus the coarse
//! [`ErrorKind`] that query-facing callers match on.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Payload does not satisfy the stream schema
    #[error("Validation error: {0}")]
    Validation(String),

    /// Datapoints are not ordered by timestamp, or precede already stored data
    #[error("Datapoints must be ordered by non-decreasing timestamp")]
    TimestampOrder,

    /// Admission would push a device or stream past its size cap
    #[error("Quota exceeded: {scope} size {size} + {incoming} bytes exceeds limit {limit}")]
    QuotaExceeded {
        scope: QuotaScope,
        size: u64,
        incoming: u64,
        limit: u64,
    },

    /// Too much data is waiting for the writer
    #[error("Backpressure: {pending} bytes pending, limit is {limit}")]
    Backpressure { pending: u64, limit: u64 },

    /// Index past the stored data
    #[error("Index {index} out of range (length {length})")]
    OutOfRange { index: i64, length: u64 },

    /// Malformed index or time range
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// A batch would leave a hole in the segment
    #[error("Index gap: segment has {committed} records, batch starts at {start}")]
    IndexGap { committed: u64, start: u64 },

    /// Segment index and data disagree, or a checksum failed
    #[error("Corrupt segment: {0}")]
    CorruptSegment(String),

    /// Segment file format error (bad magic, unknown version)
    #[error("Invalid segment format: {0}")]
    InvalidSegment(String),

    /// SQL backend failure
    #[error("SQL error: {0}")]
    Sql(String),

    /// Stream name could not be resolved
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Forced flush could not drain the cache in time
    #[error("Flush timed out with {pending} batches still pending")]
    FlushTimeout { pending: usize },

    /// The cache has been closed
    #[error("Storage is closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Which cap a [`StorageError::QuotaExceeded`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Device,
    Stream,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaScope::Device => write!(f, "device"),
            QuotaScope::Stream => write!(f, "stream"),
        }
    }
}

/// Structured error classes surfaced to query-facing callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    QuotaExceeded,
    OutOfRange,
    CorruptSegment,
    IoFailure,
    Unavailable,
    NotFound,
}

impl StorageError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Validation(_) | StorageError::TimestampOrder => ErrorKind::Validation,
            StorageError::QuotaExceeded { .. } | StorageError::Backpressure { .. } => {
                ErrorKind::QuotaExceeded
            }
            StorageError::OutOfRange { .. } | StorageError::InvalidRange(_) => {
                ErrorKind::OutOfRange
            }
            StorageError::CorruptSegment(_) | StorageError::InvalidSegment(_) => {
                ErrorKind::CorruptSegment
            }
            StorageError::StreamNotFound(_) => ErrorKind::NotFound,
            StorageError::Closed | StorageError::FlushTimeout { .. } => ErrorKind::Unavailable,
            StorageError::Io(_)
            | StorageError::Serialization(_)
            | StorageError::Compression(_)
            | StorageError::IndexGap { .. }
            | StorageError::Sql(_)
            | StorageError::Config(_)
            | StorageError::Lock(_) => ErrorKind::IoFailure,
        }
    }

    /// Message safe to hand to callers.
    ///
    /// Storage internals (paths, checksums, SQL text) are replaced by a generic
    /// message; the full error is logged here instead.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::IoFailure | ErrorKind::CorruptSegment => {
                tracing::error!(error = %self, "storage failure");
                "internal storage error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Sql(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
