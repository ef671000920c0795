//! timebatch storage layer
//!
//! This module provides durable per-stream storage:
//!
//! - **types**: Core data structures (Datapoint, StreamKey, Batch)
//! - **codec**: Payload schema validation and binary encoding
//! - **segment**: Segment file format (index + payload log)
//! - **store**: Segment store capability and the file backend
//! - **sql**: SQLite segment backend
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Batch → encode payloads → data file (fsync) → index entries (fsync)
//!
//! Read Path:
//!   Reader snapshot → binary search index → read payloads → decode
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use timebatch::storage::{CompressionType, Datapoint, FileSegmentStore, SegmentStore, StreamKey};
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileSegmentStore::open("./data", CompressionType::Lz4, true)?;
//!     let key = StreamKey::new(1, 1);
//!
//!     store.append(&key, 0, &[Datapoint::new(1.0, json!(21.5))])?;
//!
//!     let mut reader = store.reader(&key)?;
//!     let first = reader.read(0)?;
//!     println!("{} -> {}", first.timestamp, first.data);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod segment;
pub mod sql;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use codec::{
    decode_datapoint, encode_datapoint, encoded_size, marshal, unmarshal, CompressionType,
    EncodedValue, Schema,
};
pub use error::{ErrorKind, QuotaScope, StorageError, StorageResult};
pub use segment::{SegmentReader, SegmentWriter};
pub use sql::{SqliteSegmentReader, SqliteSegmentStore};
pub use store::{EmptySegment, FileSegmentStore, SegmentRead, SegmentStore};
pub use types::{
    to_nanos, Batch, Datapoint, DatapointSlice, IndexSpan, SpanEnd, StreamKey,
    TimeSearch,
};
