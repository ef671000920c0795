//! DataStream handle
//!
//! One owned handle wires a [`BatchCache`], a [`SegmentStore`] and a
//! [`ChunkWriter`] together. Inserts land in the cache and are visible to
//! reads immediately; the writer moves them into segments in the background.
//!
//! ```text
//! insert ─→ validate ─→ BatchCache ──(ChunkWriter)──→ SegmentStore
//!                           │                              │
//! irange/trange ←── StreamRange (cached tail + segment) ───┘
//! ```

use crate::cache::{BatchCache, CacheStats, MemoryCache};
use crate::config::{Config, WriterConfig};
use crate::range::{DataRange, EmptyRange, StreamRange};
use crate::storage::{
    CompressionType, Datapoint, DatapointSlice, FileSegmentStore, IndexSpan, Schema, SpanEnd,
    SqliteSegmentStore, StorageError, StorageResult, SegmentStore, StreamKey, TimeSearch,
};
use crate::writer::{ChunkReport, ChunkWriter, WriterHandle, WriterStats};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Datapoints read from a segment per chunk when no size is configured
const DEFAULT_READ_CHUNK: usize = 250;

/// Admission settings for one insert
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Every value must satisfy this schema
    pub schema: Option<Schema>,
    /// Nudge non-increasing timestamps forward instead of rejecting them
    pub restamp: bool,
    /// 0 means unlimited
    pub max_device_size: u64,
    /// 0 means unlimited
    pub max_stream_size: u64,
}

impl InsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn restamp(mut self, restamp: bool) -> Self {
        self.restamp = restamp;
        self
    }

    pub fn max_device_size(mut self, size: u64) -> Self {
        self.max_device_size = size;
        self
    }

    pub fn max_stream_size(mut self, size: u64) -> Self {
        self.max_stream_size = size;
        self
    }
}

/// Occupancy snapshot of a [`DataStream`]
#[derive(Debug, Clone)]
pub struct DataStreamStats {
    pub cache: CacheStats,
    pub writer: WriterStats,
    pub writer_running: bool,
}

impl std::fmt::Display for DataStreamStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Streams: {}, Pending: {} points / {} bytes, Batches: {} ready / {} processing",
            self.cache.streams,
            self.cache.pending_points,
            self.cache.pending_bytes,
            self.cache.ready_batches,
            self.cache.processing_batches
        )?;
        write!(
            f,
            "{} ({})",
            self.writer,
            if self.writer_running { "running" } else { "stopped" }
        )
    }
}

/// Insert and query entry point for every stream
pub struct DataStream {
    cache: Arc<dyn BatchCache>,
    store: Arc<dyn SegmentStore>,
    writer: Arc<ChunkWriter>,
    flush_timeout: Duration,
    read_chunk_size: usize,
    handle: Mutex<Option<WriterHandle>>,
}

impl DataStream {
    /// Open the backends named in `config`
    pub fn open(config: &Config) -> StorageResult<Self> {
        let compression: CompressionType = config.storage.compression.parse()?;
        let data_dir = config.data_dir();

        let store: Arc<dyn SegmentStore> = match config.storage.backend.as_str() {
            "file" => Arc::new(
                FileSegmentStore::open(&data_dir, compression, config.storage.sync_writes)?
                    .with_max_open_writers(config.storage.max_open_segments),
            ),
            "sqlite" => Arc::new(SqliteSegmentStore::open(&data_dir, compression)?),
            other => {
                return Err(StorageError::Config(format!(
                    "Unknown storage backend: {}",
                    other
                )))
            }
        };

        tracing::info!(
            data_dir = %data_dir.display(),
            backend = %config.storage.backend,
            compression = ?compression,
            "Opened data stream"
        );

        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::new(&config.cache));
        Ok(Self::with_backends(cache, store, config.writer.clone())
            .with_read_chunk_size(config.cache.batch_size))
    }

    /// Wire explicit backends together
    pub fn with_backends(
        cache: Arc<dyn BatchCache>,
        store: Arc<dyn SegmentStore>,
        writer_config: WriterConfig,
    ) -> Self {
        let flush_timeout = writer_config.flush_timeout();
        let writer = Arc::new(ChunkWriter::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            writer_config,
        ));

        Self {
            cache,
            store,
            writer,
            flush_timeout,
            read_chunk_size: DEFAULT_READ_CHUNK,
            handle: Mutex::new(None),
        }
    }

    /// Datapoints fetched from a segment per read
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Load committed length, end time and size into the cache on first touch
    fn ensure_seeded(&self, key: &StreamKey) -> StorageResult<()> {
        if self.cache.contains(key)? {
            return Ok(());
        }

        let mut reader = self.store.reader(key)?;
        let length = reader.len();
        let end_time = reader.last_timestamp()?;
        let size = reader.data_size();
        reader.close();

        self.cache.seed(key, length, end_time, size)?;
        if length > 0 {
            tracing::debug!(stream = %key, length, "Seeded stream from segment");
        }
        Ok(())
    }

    /// Admit datapoints, returning the new stream length
    ///
    /// Without `restamp` the points must be in timestamp order and not before
    /// the stream's last datapoint. Rejected inserts change nothing.
    pub fn insert(
        &self,
        key: &StreamKey,
        points: Vec<Datapoint>,
        options: &InsertOptions,
    ) -> StorageResult<u64> {
        if points.is_empty() {
            return self.stream_length(key);
        }

        if let Some((i, dp)) = points
            .iter()
            .enumerate()
            .find(|(_, dp)| !dp.timestamp.is_finite())
        {
            return Err(StorageError::Validation(format!(
                "datapoint {}: timestamp {} is not finite",
                i, dp.timestamp
            )));
        }

        if !options.restamp && !points.is_timestamp_ordered() {
            return Err(StorageError::TimestampOrder);
        }

        if let Some(schema) = &options.schema {
            for (i, dp) in points.iter().enumerate() {
                schema.validate(&dp.data).map_err(|e| match e {
                    StorageError::Validation(msg) => {
                        StorageError::Validation(format!("datapoint {}: {}", i, msg))
                    }
                    other => other,
                })?;
            }
        }

        self.ensure_seeded(key)?;
        let count = points.len();
        let length = self.cache.insert(
            key,
            points,
            options.restamp,
            options.max_device_size,
            options.max_stream_size,
        )?;

        tracing::trace!(stream = %key, count, length, "Inserted datapoints");
        Ok(length)
    }

    /// Committed plus pending datapoint count
    pub fn stream_length(&self, key: &StreamKey) -> StorageResult<u64> {
        self.ensure_seeded(key)?;
        self.cache.stream_length(key)
    }

    /// Python-style index range `[i1, i2)`
    ///
    /// Negative indices count from the end and `i2 == 0` reads to the end.
    pub fn irange(&self, key: &StreamKey, i1: i64, i2: i64) -> StorageResult<Box<dyn DataRange>> {
        self.ensure_seeded(key)?;
        let range = StreamRange::open(
            self.cache.as_ref(),
            self.store.as_ref(),
            key,
            i1,
            i2,
            self.read_chunk_size,
        )?;
        Ok(Box::new(range))
    }

    /// Absolute range `[start, end)`, or `[start, ..)` when `end` is `None`
    ///
    /// `end` is clamped to the stream length, so it never reaches the
    /// end-relative form of `irange`.
    fn span(&self, key: &StreamKey, start: u64, end: Option<u64>) -> StorageResult<Box<dyn DataRange>> {
        let end = match end {
            Some(end) => Some(end.min(self.stream_length(key)?)),
            None => None,
        };
        match end {
            Some(end) if end <= start => Ok(Box::new(EmptyRange::at(start))),
            Some(end) => self.irange(key, start as i64, end as i64),
            None => self.irange(key, start as i64, 0),
        }
    }

    /// First index whose timestamp is strictly greater than `t`
    ///
    /// Searches the cached tail first and falls back to the segment when the
    /// answer may lie among committed datapoints.
    pub fn time_index(&self, key: &StreamKey, t: f64) -> StorageResult<TimeSearch> {
        self.ensure_seeded(key)?;
        let cached = self.cache.find_time(key, t)?;

        if let TimeSearch::Found(i) = cached.search {
            if i > cached.cached_from {
                return Ok(cached.search);
            }
        }
        if cached.cached_from == 0 {
            return Ok(cached.search);
        }

        let mut reader = self.store.reader(key)?;
        let committed = reader.find_time(t)?;
        reader.close();

        Ok(match committed {
            TimeSearch::Found(i) => TimeSearch::Found(i),
            TimeSearch::PastEnd(_) => cached.search,
        })
    }

    /// Index span of datapoints with `t1 < ts <= t2`
    pub fn find_time_range(
        &self,
        key: &StreamKey,
        t1: f64,
        t2: Option<f64>,
    ) -> StorageResult<IndexSpan> {
        check_time_order(t1, t2)?;
        let start = self.time_index(key, t1)?.index();
        let end = match t2 {
            None => SpanEnd::OpenTail,
            Some(t2) => match self.time_index(key, t2)? {
                TimeSearch::Found(i) => SpanEnd::Bounded(i),
                TimeSearch::PastEnd(_) => SpanEnd::OpenTail,
            },
        };
        Ok(IndexSpan { start, end })
    }

    /// Datapoints with `t1 < ts <= t2`, at most `limit` of them
    ///
    /// `t2 == None` reads to the end of the stream.
    pub fn trange(
        &self,
        key: &StreamKey,
        t1: f64,
        t2: Option<f64>,
        limit: Option<u64>,
    ) -> StorageResult<Box<dyn DataRange>> {
        check_time_order(t1, t2)?;
        let start = self.time_index(key, t1)?.index();
        let end = match t2 {
            Some(t2) => Some(self.time_index(key, t2)?.index()),
            None => None,
        };
        let end = match (end, limit) {
            (Some(end), Some(limit)) => Some(end.min(start.saturating_add(limit))),
            (None, Some(limit)) => Some(start.saturating_add(limit)),
            (end, None) => end,
        };
        self.span(key, start, end)
    }

    /// Range starting `shift` datapoints from the first one after `t`
    ///
    /// A shift before the first datapoint starts at index 0. The range runs to
    /// the end of the stream, or up to `t2` inclusive.
    pub fn time_plus_index_range(
        &self,
        key: &StreamKey,
        t: f64,
        shift: i64,
        t2: Option<f64>,
    ) -> StorageResult<Box<dyn DataRange>> {
        let base = self.time_index(key, t)?.index() as i64;
        let start = base.saturating_add(shift).max(0) as u64;
        let end = match t2 {
            Some(t2) => Some(self.time_index(key, t2)?.index()),
            None => None,
        };
        self.span(key, start, end)
    }

    pub fn delete_device(&self, device: i64) -> StorageResult<()> {
        self.cache.delete_device(device)?;
        self.store.delete_device(device)?;
        tracing::info!(device, "Deleted device");
        Ok(())
    }

    pub fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()> {
        self.cache.delete_stream(device, stream)?;
        self.store.delete_stream(device, stream)?;
        tracing::info!(device, stream, "Deleted stream");
        Ok(())
    }

    pub fn delete_substream(&self, key: &StreamKey) -> StorageResult<()> {
        self.cache.delete_substream(key)?;
        self.store.delete_substream(key)?;
        tracing::info!(stream = %key, "Deleted substream");
        Ok(())
    }

    /// Rebuild a corrupt segment, returning its recovered length
    pub fn repair(&self, key: &StreamKey) -> StorageResult<u64> {
        let length = self.store.repair(key)?;
        tracing::warn!(stream = %key, length, "Repaired segment");
        Ok(length)
    }

    /// Run one writer poll cycle on the calling thread
    pub fn write_chunk(&self) -> StorageResult<ChunkReport> {
        self.writer.write_chunk()
    }

    /// Start the background writer; no-op if it is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_writer(&self) -> StorageResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StorageError::Config(
                "the background writer needs a tokio runtime".to_string(),
            ));
        }

        let mut handle = self.handle.lock()?;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        *handle = Some(self.writer.spawn());
        Ok(())
    }

    /// Reject new inserts, stop the writer and commit everything pending
    ///
    /// `timeout` defaults to the configured flush timeout. Data that could
    /// not be committed in time stays cached and is reported as
    /// `FlushTimeout`.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> StorageResult<()> {
        self.cache.close()?;

        let handle = self.handle.lock()?.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        self.writer
            .flush(timeout.unwrap_or(self.flush_timeout))
            .await
    }

    pub fn stats(&self) -> StorageResult<DataStreamStats> {
        let writer_running = self
            .handle
            .lock()?
            .as_ref()
            .is_some_and(|h| !h.is_finished());

        Ok(DataStreamStats {
            cache: self.cache.stats()?,
            writer: self.writer.stats()?,
            writer_running,
        })
    }

    /// Drop all cached and committed data
    pub fn clear(&self) -> StorageResult<()> {
        self.cache.clear()?;
        self.store.clear()?;
        tracing::warn!("Cleared all streams");
        Ok(())
    }
}

fn check_time_order(t1: f64, t2: Option<f64>) -> StorageResult<()> {
    match t2 {
        Some(t2) if t2 < t1 => Err(StorageError::InvalidRange(format!(
            "end time {} is before start time {}",
            t2, t1
        ))),
        _ => Ok(()),
    }
}
