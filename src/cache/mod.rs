//! Write-behind caching
//!
//! - **BatchCache**: landing zone for inserts, giving read-after-write
//!   consistency before the Chunk Writer commits them
//! - **MemoryCache**: process-local `BatchCache`
//! - **MetadataCache**: LRU + TTL map of names to numeric IDs

pub mod memory;
pub mod metadata;

pub use memory::MemoryCache;
pub use metadata::MetadataCache;

use crate::storage::{Batch, Datapoint, StorageResult, StreamKey, TimeSearch};

/// Cached slice of a resolved index range
///
/// `[start, end)` is the full range the caller asked for, resolved against the
/// stream length. Only `[cached_from, end)` is held in `points`; anything
/// before `cached_from` has been committed and cleared.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRange {
    pub start: u64,
    pub end: u64,
    pub cached_from: u64,
    pub points: Vec<Datapoint>,
}

/// Result of a time search over the cached window of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedSearch {
    /// First index still held by the cache
    pub cached_from: u64,
    /// Search over `[cached_from, length)`; `PastEnd(length)` when no cached
    /// datapoint is after the searched time
    pub search: TimeSearch,
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub streams: usize,
    pub ready_batches: usize,
    pub processing_batches: usize,
    pub pending_points: u64,
    pub pending_bytes: u64,
}

impl CacheStats {
    /// Batches not yet cleared
    pub fn pending_batches(&self) -> usize {
        self.ready_batches + self.processing_batches
    }
}

/// Buffer of pending inserts with quota bookkeeping and a claimable batch queue
pub trait BatchCache: Send + Sync {
    /// Pending plus committed datapoint count, 0 for unknown streams
    fn stream_length(&self, key: &StreamKey) -> StorageResult<u64>;

    /// Bytes admitted for a device, pending plus committed
    fn device_size(&self, device: i64) -> StorageResult<u64>;

    /// Bytes admitted for a stream across all its substreams
    fn stream_size(&self, key: &StreamKey) -> StorageResult<u64>;

    /// Whether bookkeeping exists for the stream
    fn contains(&self, key: &StreamKey) -> StorageResult<bool>;

    /// Initialise bookkeeping from committed state; no-op for known streams
    fn seed(
        &self,
        key: &StreamKey,
        length: u64,
        end_time: Option<f64>,
        size: u64,
    ) -> StorageResult<()>;

    /// Admit datapoints, returning the new stream length
    ///
    /// A cap of 0 means unlimited. Rejections leave the cache untouched.
    fn insert(
        &self,
        key: &StreamKey,
        points: Vec<Datapoint>,
        restamp: bool,
        max_device_size: u64,
        max_stream_size: u64,
    ) -> StorageResult<u64>;

    fn delete_device(&self, device: i64) -> StorageResult<()>;

    fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()>;

    fn delete_substream(&self, key: &StreamKey) -> StorageResult<()>;

    /// Claim every ready batch
    fn read_processing_queue(&self) -> StorageResult<Vec<Batch>>;

    /// Claim up to `n` ready batches, oldest first
    fn read_batches(&self, n: usize) -> StorageResult<Vec<Batch>>;

    /// Return claimed batches that failed to commit to the front of the queue
    fn release_batches(&self, batches: &[Batch]) -> StorageResult<()>;

    /// Seal every partial tail into a ready batch
    fn flush_pending(&self) -> StorageResult<usize>;

    /// Cached portion of the python-style index range `[i1, i2)`
    ///
    /// Negative `i1` counts from the end. `i2 <= 0` is relative to the end,
    /// with 0 meaning "to the end".
    fn read_range(&self, key: &StreamKey, i1: i64, i2: i64) -> StorageResult<CacheRange>;

    /// Time search over the cached window
    fn find_time(&self, key: &StreamKey, t: f64) -> StorageResult<CachedSearch>;

    /// Drop committed batches from the pending queue
    fn clear_batches(&self, batches: &[Batch]) -> StorageResult<()>;

    fn stats(&self) -> StorageResult<CacheStats>;

    /// Drop everything
    fn clear(&self) -> StorageResult<()>;

    /// Reject further inserts; pending data stays for the final flush
    fn close(&self) -> StorageResult<()>;

    fn is_closed(&self) -> bool;
}

/// Resolve python-style indices against a stream length
pub(crate) fn resolve_range(i1: i64, i2: i64, length: u64) -> StorageResult<(u64, u64)> {
    use crate::storage::StorageError;

    let len = length as i64;
    let start = if i1 < 0 { (len + i1).max(0) } else { i1 };
    if start > len {
        return Err(StorageError::OutOfRange { index: i1, length });
    }

    let end = if i2 <= 0 { (len + i2).max(0) } else { i2.min(len) };
    if end < start {
        return Err(StorageError::InvalidRange(format!(
            "range [{}, {}) resolves to [{}, {}) over length {}",
            i1, i2, start, end, length
        )));
    }

    Ok((start as u64, end as u64))
}
