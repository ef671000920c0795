//! # timebatch
//!
//! Write-behind storage for multi-tenant time-series streams. Inserts land in
//! a batch cache and are readable at once; a background chunk writer commits
//! them in batches to durable, append-only segments.
//!
//! ## Features
//!
//! - **Read-your-writes**: ranges stitch committed segments with the cached tail
//! - **Quotas**: per-device and per-stream byte caps, checked at admission
//! - **Durability**: CRC-checked segment files with crash-safe append order
//! - **Backends**: per-stream segment files or a single SQLite table
//!
//! ## Modules
//!
//! - [`storage`]: Segment formats, payload codec and segment stores
//! - [`cache`]: Batch cache and the name/ID metadata cache
//! - [`writer`]: Background chunk writer
//! - [`range`]: Read cursors over committed and pending data
//! - [`stream`]: The [`DataStream`] handle tying it all together
//! - [`catalog`]: Named stream definitions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use timebatch::{Config, DataStream, Datapoint, InsertOptions, StreamKey};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ds = DataStream::open(&Config::default())?;
//!     ds.start_writer()?;
//!
//!     let key = StreamKey::new(1, 1);
//!     ds.insert(&key, vec![Datapoint::now(json!(21.5))], &InsertOptions::new())?;
//!
//!     // Last 10 datapoints, whether committed yet or not
//!     let mut range = ds.irange(&key, -10, 0)?;
//!     while let Some(dp) = range.next()? {
//!         println!("{} {}", dp.timestamp, dp.data);
//!     }
//!
//!     // Commit everything still pending
//!     ds.shutdown(None).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod range;
pub mod storage;
pub mod stream;
pub mod writer;

// Re-export top-level types for convenience
pub use storage::{
    CompressionType, Datapoint, ErrorKind, IndexSpan, Schema, SegmentStore, SpanEnd,
    StorageError, StorageResult, StreamKey, TimeSearch,
};

pub use cache::{BatchCache, CacheStats, MemoryCache, MetadataCache};

pub use catalog::{StreamCatalog, StreamDef, StreamPatch};

pub use config::{Config, ConfigError};

pub use range::{read_all, DataRange, EmptyRange, StreamRange};

pub use stream::{DataStream, DataStreamStats, InsertOptions};

pub use writer::{ChunkReport, ChunkWriter, WriterHandle, WriterState, WriterStats};
