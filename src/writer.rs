//! Chunk writer
//!
//! Drains claimed batches from the [`BatchCache`] into the [`SegmentStore`].
//!
//! ```text
//! Idle → Polling ─┬─ no batches ──────────────────────────────→ Idle
//!                 └─ batches → Writing → Committed → ClearBatches → Idle
//! ```
//!
//! Delivery is at-least-once: a batch is cleared from the cache only after
//! its append succeeded, and failed batches go back to the front of the queue.
//! The store's commit watermark makes the retried append idempotent.

use crate::cache::BatchCache;
use crate::config::WriterConfig;
use crate::storage::{Batch, SegmentStore, StorageError, StorageResult, StreamKey};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where the writer is in its poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterState {
    #[default]
    Idle,
    Polling,
    Writing,
    Committed,
    ClearBatches,
}

impl std::fmt::Display for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterState::Idle => write!(f, "idle"),
            WriterState::Polling => write!(f, "polling"),
            WriterState::Writing => write!(f, "writing"),
            WriterState::Committed => write!(f, "committed"),
            WriterState::ClearBatches => write!(f, "clearing"),
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub committed: usize,
    pub failed: usize,
    /// Datapoints newly written to segments
    pub points: u64,
}

impl ChunkReport {
    pub fn is_idle(&self) -> bool {
        self.committed == 0 && self.failed == 0
    }
}

/// Running totals
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub state: WriterState,
    pub polls: u64,
    pub committed_batches: u64,
    pub committed_points: u64,
    pub failed_attempts: u64,
    pub last_error: Option<String>,
}

impl std::fmt::Display for WriterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Writer: {}, Polls: {}, Committed: {} batches / {} points, Failures: {}",
            self.state,
            self.polls,
            self.committed_batches,
            self.committed_points,
            self.failed_attempts
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " (last: {})", err)?;
        }
        Ok(())
    }
}

/// Commits cached batches to the segment store
pub struct ChunkWriter {
    cache: Arc<dyn BatchCache>,
    store: Arc<dyn SegmentStore>,
    config: WriterConfig,
    stats: Mutex<WriterStats>,
}

impl ChunkWriter {
    pub fn new(
        cache: Arc<dyn BatchCache>,
        store: Arc<dyn SegmentStore>,
        config: WriterConfig,
    ) -> Self {
        Self {
            cache,
            store,
            config,
            stats: Mutex::new(WriterStats::default()),
        }
    }

    fn set_state(&self, state: WriterState) -> StorageResult<()> {
        self.stats.lock()?.state = state;
        Ok(())
    }

    /// Run one poll cycle over at most `chunk_size` batches
    ///
    /// Blocks on segment I/O.
    pub fn write_chunk(&self) -> StorageResult<ChunkReport> {
        self.set_state(WriterState::Polling)?;
        let batches = match self.cache.read_batches(self.config.chunk_size) {
            Ok(batches) => batches,
            Err(e) => {
                self.set_state(WriterState::Idle)?;
                return Err(e);
            }
        };
        if batches.is_empty() {
            let mut stats = self.stats.lock()?;
            stats.polls += 1;
            stats.state = WriterState::Idle;
            return Ok(ChunkReport::default());
        }

        self.set_state(WriterState::Writing)?;
        let mut committed: Vec<Batch> = Vec::with_capacity(batches.len());
        let mut failed: Vec<Batch> = Vec::new();
        let mut blocked: HashSet<StreamKey> = HashSet::new();
        let mut points = 0;
        let mut last_error = None;

        for batch in batches {
            // Later batches of a failed stream would only hit an index gap
            if blocked.contains(&batch.key) {
                failed.push(batch);
                continue;
            }

            match self
                .store
                .append(&batch.key, batch.start_index, &batch.data)
            {
                Ok(written) => {
                    points += written;
                    committed.push(batch);
                }
                Err(e) => {
                    tracing::warn!(
                        stream = %batch.key,
                        start = batch.start_index,
                        error = %e,
                        "Batch commit failed, will retry"
                    );
                    last_error = Some(e.to_string());
                    blocked.insert(batch.key.clone());
                    failed.push(batch);
                }
            }
        }

        self.set_state(WriterState::Committed)?;
        self.set_state(WriterState::ClearBatches)?;
        self.cache.clear_batches(&committed)?;
        if !failed.is_empty() {
            self.cache.release_batches(&failed)?;
        }

        let report = ChunkReport {
            committed: committed.len(),
            failed: failed.len(),
            points,
        };

        {
            let mut stats = self.stats.lock()?;
            stats.polls += 1;
            stats.committed_batches += report.committed as u64;
            stats.committed_points += report.points;
            if report.failed > 0 {
                stats.failed_attempts += 1;
                stats.last_error = last_error;
            }
            stats.state = WriterState::Idle;
        }

        tracing::debug!(
            committed = report.committed,
            failed = report.failed,
            points = report.points,
            "Chunk written"
        );

        Ok(report)
    }

    pub fn stats(&self) -> StorageResult<WriterStats> {
        Ok(self.stats.lock()?.clone())
    }

    /// Start the background drain loop on the tokio runtime
    pub fn spawn(self: &Arc<Self>) -> WriterHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let writer = Arc::clone(self);

        let task = tokio::spawn(async move {
            let poll_interval = writer.config.poll_interval();
            let mut backoff = writer.config.retry_backoff();

            tracing::info!(
                chunk_size = writer.config.chunk_size,
                poll_ms = writer.config.poll_interval_ms,
                "Chunk writer started"
            );

            loop {
                let stopping = *rx.borrow();
                if stopping {
                    break;
                }

                let delay = match writer.write_chunk_blocking().await {
                    Ok(report) if report.failed == 0 => {
                        backoff = writer.config.retry_backoff();
                        if report.committed > 0 {
                            // More work may be queued
                            continue;
                        }
                        poll_interval
                    }
                    Ok(report) => {
                        tracing::warn!(
                            failed = report.failed,
                            backoff_ms = backoff.as_millis() as u64,
                            "Backing off after failed commits"
                        );
                        next_backoff(&mut backoff, writer.config.max_backoff())
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Chunk writer cycle failed");
                        next_backoff(&mut backoff, writer.config.max_backoff())
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Chunk writer stopped");
        });

        WriterHandle { shutdown, task }
    }

    async fn write_chunk_blocking(self: &Arc<Self>) -> StorageResult<ChunkReport> {
        let writer = Arc::clone(self);
        tokio::task::spawn_blocking(move || writer.write_chunk())
            .await
            .map_err(|e| StorageError::Lock(format!("writer task failed: {}", e)))?
    }

    /// Seal partial tails and drain every pending batch
    ///
    /// Fails with `FlushTimeout` if batches remain once `timeout` has passed.
    pub async fn flush(self: &Arc<Self>, timeout: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let sealed = self.cache.flush_pending()?;
        tracing::info!(sealed, timeout_ms = timeout.as_millis() as u64, "Flushing pending batches");

        let mut backoff = self.config.retry_backoff();
        loop {
            let pending = self.cache.stats()?.pending_batches();
            if pending == 0 {
                tracing::info!("Flush complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::error!(pending, "Flush timed out");
                return Err(StorageError::FlushTimeout { pending });
            }

            let report = match tokio::time::timeout_at(deadline, self.write_chunk_blocking()).await {
                Ok(result) => result?,
                Err(_) => continue,
            };

            if report.failed > 0 {
                let delay = next_backoff(&mut backoff, self.config.max_backoff());
                tokio::time::sleep_until((Instant::now() + delay).min(deadline)).await;
            } else if report.is_idle() {
                // Batches are claimed elsewhere; wait for them to clear
                tokio::time::sleep_until((Instant::now() + self.config.poll_interval()).min(deadline))
                    .await;
            }
        }
    }
}

fn next_backoff(backoff: &mut Duration, max: Duration) -> Duration {
    let current = *backoff;
    *backoff = (*backoff * 2).min(max);
    current
}

/// Handle to a running background writer
pub struct WriterHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Signal the loop to stop and wait for the current cycle to finish
    pub async fn stop(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("Chunk writer already exited");
        }
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Chunk writer task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::{
        CompressionType, Datapoint, FileSegmentStore, SegmentRead, StorageResult,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn points(timestamps: &[f64]) -> Vec<Datapoint> {
        timestamps
            .iter()
            .map(|t| Datapoint::new(*t, json!(t)))
            .collect()
    }

    fn writer_config(chunk_size: usize) -> WriterConfig {
        WriterConfig {
            chunk_size,
            poll_interval_ms: 5,
            retry_backoff_ms: 5,
            max_backoff_ms: 20,
            flush_timeout_ms: 2_000,
        }
    }

    /// Store that fails the first `failures` appends to one stream
    struct FlakyStore {
        inner: FileSegmentStore,
        flaky: StreamKey,
        failures: AtomicUsize,
    }

    impl SegmentStore for FlakyStore {
        fn create(&self, key: &StreamKey) -> StorageResult<()> {
            self.inner.create(key)
        }

        fn length(&self, key: &StreamKey) -> StorageResult<u64> {
            self.inner.length(key)
        }

        fn append(
            &self,
            key: &StreamKey,
            start_index: u64,
            points: &[Datapoint],
        ) -> StorageResult<u64> {
            if key == &self.flaky
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            self.inner.append(key, start_index, points)
        }

        fn reader(&self, key: &StreamKey) -> StorageResult<Box<dyn SegmentRead>> {
            self.inner.reader(key)
        }

        fn delete_substream(&self, key: &StreamKey) -> StorageResult<()> {
            self.inner.delete_substream(key)
        }

        fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()> {
            self.inner.delete_stream(device, stream)
        }

        fn delete_device(&self, device: i64) -> StorageResult<()> {
            self.inner.delete_device(device)
        }

        fn clear(&self) -> StorageResult<()> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_write_chunk_commits_and_clears() {
        let dir = tempdir().unwrap();
        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::with_batch_size(2));
        let store: Arc<dyn SegmentStore> = Arc::new(
            FileSegmentStore::open(dir.path(), CompressionType::Lz4, false).unwrap(),
        );
        let writer = ChunkWriter::new(Arc::clone(&cache), Arc::clone(&store), writer_config(5));
        let key = StreamKey::new(1, 1);

        assert!(writer.write_chunk().unwrap().is_idle());

        cache
            .insert(&key, points(&[1.0, 2.0, 3.0, 4.0, 5.0]), false, 0, 0)
            .unwrap();
        let report = writer.write_chunk().unwrap();
        assert_eq!(report.committed, 2);
        assert_eq!(report.points, 4);
        assert_eq!(store.length(&key).unwrap(), 4);

        let range = cache.read_range(&key, 0, 0).unwrap();
        assert_eq!(range.cached_from, 4);

        let stats = writer.stats().unwrap();
        assert_eq!(stats.committed_batches, 2);
        assert_eq!(stats.state, WriterState::Idle);
    }

    #[test]
    fn test_chunk_size_bounds_each_poll() {
        let dir = tempdir().unwrap();
        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::with_batch_size(1));
        let store: Arc<dyn SegmentStore> = Arc::new(
            FileSegmentStore::open(dir.path(), CompressionType::None, false).unwrap(),
        );
        let writer = ChunkWriter::new(Arc::clone(&cache), store, writer_config(2));
        cache
            .insert(&StreamKey::new(1, 1), points(&[1.0, 2.0, 3.0]), false, 0, 0)
            .unwrap();

        assert_eq!(writer.write_chunk().unwrap().committed, 2);
        assert_eq!(writer.write_chunk().unwrap().committed, 1);
        assert!(writer.write_chunk().unwrap().is_idle());
    }

    #[test]
    fn test_failed_batches_are_retried_in_order() {
        let dir = tempdir().unwrap();
        let flaky = StreamKey::new(1, 1);
        let healthy = StreamKey::new(1, 2);
        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::with_batch_size(2));
        let store = Arc::new(FlakyStore {
            inner: FileSegmentStore::open(dir.path(), CompressionType::None, false).unwrap(),
            flaky: flaky.clone(),
            failures: AtomicUsize::new(1),
        });
        let writer = ChunkWriter::new(
            Arc::clone(&cache),
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            writer_config(10),
        );

        cache
            .insert(&flaky, points(&[1.0, 2.0, 3.0, 4.0]), false, 0, 0)
            .unwrap();
        cache.insert(&healthy, points(&[1.0, 2.0]), false, 0, 0).unwrap();

        let report = writer.write_chunk().unwrap();
        // Both batches of the flaky stream are held back, the healthy one commits
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(store.length(&flaky).unwrap(), 0);
        assert_eq!(store.length(&healthy).unwrap(), 2);
        assert!(writer.stats().unwrap().last_error.is_some());

        // Still readable from the cache while uncommitted
        assert_eq!(cache.read_range(&flaky, 0, 0).unwrap().points.len(), 4);

        let report = writer.write_chunk().unwrap();
        assert_eq!(report.committed, 2);
        assert_eq!(store.length(&flaky).unwrap(), 4);
        assert_eq!(cache.stats().unwrap().pending_batches(), 0);
    }

    #[tokio::test]
    async fn test_background_writer_drains() {
        let dir = tempdir().unwrap();
        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::with_batch_size(2));
        let store: Arc<dyn SegmentStore> = Arc::new(
            FileSegmentStore::open(dir.path(), CompressionType::Lz4, false).unwrap(),
        );
        let writer = Arc::new(ChunkWriter::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            writer_config(1),
        ));
        let handle = writer.spawn();

        let key = StreamKey::new(3, 3);
        cache
            .insert(&key, points(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), false, 0, 0)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.length(&key).unwrap() < 6 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.length(&key).unwrap(), 6);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_flush_drains_partial_tails() {
        let dir = tempdir().unwrap();
        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::with_batch_size(100));
        let store: Arc<dyn SegmentStore> = Arc::new(
            FileSegmentStore::open(dir.path(), CompressionType::Lz4, false).unwrap(),
        );
        let writer = Arc::new(ChunkWriter::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            writer_config(1),
        ));

        let a = StreamKey::new(1, 1);
        let b = StreamKey::substream(1, 1, "x");
        cache.insert(&a, points(&[1.0, 2.0, 3.0]), false, 0, 0).unwrap();
        cache.insert(&b, points(&[1.0]), false, 0, 0).unwrap();

        writer.flush(Duration::from_secs(2)).await.unwrap();
        assert_eq!(store.length(&a).unwrap(), 3);
        assert_eq!(store.length(&b).unwrap(), 1);
        assert_eq!(cache.stats().unwrap().pending_points, 0);
    }

    #[tokio::test]
    async fn test_flush_reports_timeout() {
        let dir = tempdir().unwrap();
        let key = StreamKey::new(1, 1);
        let cache: Arc<dyn BatchCache> = Arc::new(MemoryCache::with_batch_size(1));
        let store = Arc::new(FlakyStore {
            inner: FileSegmentStore::open(dir.path(), CompressionType::None, false).unwrap(),
            flaky: key.clone(),
            failures: AtomicUsize::new(usize::MAX),
        });
        let writer = Arc::new(ChunkWriter::new(
            Arc::clone(&cache),
            store as Arc<dyn SegmentStore>,
            writer_config(1),
        ));

        cache.insert(&key, points(&[1.0]), false, 0, 0).unwrap();
        let err = writer.flush(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, StorageError::FlushTimeout { pending: 1 }));
        // Nothing was dropped
        assert_eq!(cache.stream_length(&key).unwrap(), 1);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Duration::from_millis(100);
        let max = Duration::from_millis(350);
        assert_eq!(next_backoff(&mut backoff, max), Duration::from_millis(100));
        assert_eq!(next_backoff(&mut backoff, max), Duration::from_millis(200));
        assert_eq!(next_backoff(&mut backoff, max), Duration::from_millis(350));
        assert_eq!(next_backoff(&mut backoff, max), Duration::from_millis(350));
    }
}
