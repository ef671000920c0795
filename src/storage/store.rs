//! Segment store capability and the file-backed implementation
//!
//! A [`SegmentStore`] owns the durable segments of every stream. Backends are
//! chosen at construction: [`FileSegmentStore`] keeps one segment directory per
//! stream, [`SqliteSegmentStore`](crate::storage::sql::SqliteSegmentStore) keeps
//! all records in one table.

use crate::storage::codec::{encode_datapoint, CompressionType};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::{SegmentReader, SegmentWriter, INDEX_FILE};
use crate::storage::types::{Datapoint, IndexSpan, SpanEnd, StreamKey, TimeSearch};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Random and time-based access to one committed segment
pub trait SegmentRead: Send {
    /// Committed record count at the time the reader was opened
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record at `index`; `OutOfRange` past `len()`
    fn read(&mut self, index: u64) -> StorageResult<Datapoint>;

    /// Records `[i1, i2)`, with `i2` clamped to `len()`
    fn read_batch(&mut self, i1: u64, i2: u64) -> StorageResult<Vec<Datapoint>>;

    /// First index whose timestamp is strictly greater than `t`
    fn find_time(&mut self, t: f64) -> StorageResult<TimeSearch>;

    /// Index span covering timestamps in `(t1, t2]`
    fn find_time_range(&mut self, t1: f64, t2: Option<f64>) -> StorageResult<IndexSpan> {
        if let Some(t2) = t2 {
            if t2 < t1 {
                return Err(StorageError::InvalidRange(format!(
                    "end time {} is before start time {}",
                    t2, t1
                )));
            }
        }

        let start = self.find_time(t1)?.index();
        let end = match t2 {
            None => SpanEnd::OpenTail,
            Some(t2) => match self.find_time(t2)? {
                TimeSearch::Found(i) => SpanEnd::Bounded(i),
                TimeSearch::PastEnd(_) => SpanEnd::OpenTail,
            },
        };

        Ok(IndexSpan { start, end })
    }

    /// Exact timestamp of the last committed record
    fn last_timestamp(&mut self) -> StorageResult<Option<f64>>;

    /// Bytes of payload held by the segment
    fn data_size(&self) -> u64;

    /// Release underlying handles early; dropping the reader does the same
    fn close(&mut self) {}
}

/// Reader over a stream with no committed data
#[derive(Debug, Default)]
pub struct EmptySegment;

impl SegmentRead for EmptySegment {
    fn len(&self) -> u64 {
        0
    }

    fn read(&mut self, index: u64) -> StorageResult<Datapoint> {
        Err(StorageError::OutOfRange {
            index: index as i64,
            length: 0,
        })
    }

    fn read_batch(&mut self, i1: u64, _i2: u64) -> StorageResult<Vec<Datapoint>> {
        self.read(i1).map(|dp| vec![dp])
    }

    fn find_time(&mut self, _t: f64) -> StorageResult<TimeSearch> {
        Ok(TimeSearch::PastEnd(0))
    }

    fn last_timestamp(&mut self) -> StorageResult<Option<f64>> {
        Ok(None)
    }

    fn data_size(&self) -> u64 {
        0
    }
}

/// Durable per-stream storage of committed datapoints
pub trait SegmentStore: Send + Sync {
    /// Allocate storage for a stream; idempotent
    fn create(&self, key: &StreamKey) -> StorageResult<()>;

    /// Committed record count, 0 for unknown streams
    fn length(&self, key: &StreamKey) -> StorageResult<u64>;

    /// Commit a batch whose first datapoint has absolute index `start_index`
    ///
    /// Records already committed are skipped, so retrying a batch never
    /// double-appends. Returns the number of records newly written.
    fn append(&self, key: &StreamKey, start_index: u64, points: &[Datapoint])
        -> StorageResult<u64>;

    /// Snapshot reader; an empty reader for unknown streams
    fn reader(&self, key: &StreamKey) -> StorageResult<Box<dyn SegmentRead>>;

    fn delete_substream(&self, key: &StreamKey) -> StorageResult<()>;

    fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()>;

    fn delete_device(&self, device: i64) -> StorageResult<()>;

    /// Remove every stream
    fn clear(&self) -> StorageResult<()>;

    /// Bring a corrupt segment back to a usable state, returning its length
    fn repair(&self, key: &StreamKey) -> StorageResult<u64> {
        self.length(key)
    }
}

/// Number of leading points to skip so `append` resumes at the watermark
pub(crate) fn watermark_skip(
    key: &StreamKey,
    committed: u64,
    start_index: u64,
    len: usize,
) -> StorageResult<usize> {
    if start_index > committed {
        return Err(StorageError::IndexGap {
            committed,
            start: start_index,
        });
    }
    let skip = (committed - start_index).min(len as u64) as usize;
    if skip > 0 {
        tracing::debug!(stream = %key, skipped = skip, "Skipping already committed records");
    }
    Ok(skip)
}

/// Open segment writers kept when no limit is configured
pub const DEFAULT_MAX_OPEN_WRITERS: usize = 256;

/// A cached writer; `None` once evicted, so late holders reopen
type SharedWriter = Arc<Mutex<Option<SegmentWriter>>>;

/// Segment files under `<data_dir>/segments/<device>/<stream>/<substream>/`
///
/// At most `max_open_writers` segments keep their files open; the least
/// recently written one is closed to make room.
pub struct FileSegmentStore {
    root: PathBuf,
    compression: CompressionType,
    sync_writes: bool,
    writers: Mutex<LruCache<StreamKey, SharedWriter>>,
}

impl FileSegmentStore {
    pub fn open(
        data_dir: impl AsRef<Path>,
        compression: CompressionType,
        sync_writes: bool,
    ) -> StorageResult<Self> {
        let root = data_dir.as_ref().join("segments");
        std::fs::create_dir_all(&root)?;

        tracing::info!(path = %root.display(), ?compression, sync_writes, "Opened file segment store");

        Ok(Self {
            root,
            compression,
            sync_writes,
            writers: Mutex::new(LruCache::new(writer_capacity(DEFAULT_MAX_OPEN_WRITERS))),
        })
    }

    /// Cap the number of segments holding open file handles
    pub fn with_max_open_writers(mut self, max: usize) -> Self {
        self.writers = Mutex::new(LruCache::new(writer_capacity(max)));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Segments currently holding open writers
    pub fn open_writers(&self) -> StorageResult<usize> {
        Ok(self.writers.lock()?.len())
    }

    fn segment_dir(&self, key: &StreamKey) -> PathBuf {
        self.root.join(key.relative_dir())
    }

    fn writer(&self, key: &StreamKey) -> StorageResult<SharedWriter> {
        let mut writers = self.writers.lock()?;
        if let Some(writer) = writers.get(key) {
            return Ok(Arc::clone(writer));
        }

        let writer = Arc::new(Mutex::new(Some(SegmentWriter::open(
            self.segment_dir(key),
            self.sync_writes,
        )?)));
        if let Some((evicted_key, evicted)) = writers.push(key.clone(), Arc::clone(&writer)) {
            if evicted_key != *key {
                // Waits out a write in flight, then closes both files
                evicted.lock()?.take();
                tracing::debug!(stream = %evicted_key, "Closed idle segment writer");
            }
        }
        Ok(writer)
    }

    /// Run `f` against the live writer of `key`, reopening it if it was evicted
    fn with_writer<T>(
        &self,
        key: &StreamKey,
        mut f: impl FnMut(&mut SegmentWriter) -> StorageResult<T>,
    ) -> StorageResult<T> {
        loop {
            let shared = self.writer(key)?;
            let mut guard = shared.lock()?;
            if let Some(writer) = guard.as_mut() {
                return f(writer);
            }
        }
    }

    /// Close cached writers matching `pred`, waiting out any write in flight
    fn evict_writers(&self, pred: impl Fn(&StreamKey) -> bool) -> StorageResult<()> {
        let mut writers = self.writers.lock()?;
        let keys: Vec<StreamKey> = writers
            .iter()
            .map(|(k, _)| k)
            .filter(|k| pred(k))
            .cloned()
            .collect();
        for key in keys {
            if let Some(writer) = writers.pop(&key) {
                writer.lock()?.take();
            }
        }
        Ok(())
    }

    fn remove_dir(path: &Path) -> StorageResult<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn writer_capacity(max: usize) -> NonZeroUsize {
    NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN)
}

impl SegmentStore for FileSegmentStore {
    fn create(&self, key: &StreamKey) -> StorageResult<()> {
        self.with_writer(key, |_| Ok(()))
    }

    fn length(&self, key: &StreamKey) -> StorageResult<u64> {
        let cached = self.writers.lock()?.peek(key).cloned();
        if let Some(shared) = cached {
            if let Some(writer) = shared.lock()?.as_ref() {
                return Ok(writer.len());
            }
        }
        if !self.segment_dir(key).join(INDEX_FILE).exists() {
            return Ok(0);
        }
        self.with_writer(key, |writer| Ok(writer.len()))
    }

    fn append(
        &self,
        key: &StreamKey,
        start_index: u64,
        points: &[Datapoint],
    ) -> StorageResult<u64> {
        self.with_writer(key, |writer| {
            let skip = watermark_skip(key, writer.len(), start_index, points.len())?;
            if skip == points.len() {
                return Ok(0);
            }

            for dp in &points[skip..] {
                let payload = encode_datapoint(dp, self.compression)?;
                writer.batch_insert(dp.timestamp_nanos(), payload);
            }
            let written = writer.batch_write()?;

            tracing::debug!(stream = %key, written, length = writer.len(), "Appended to segment");
            Ok(written)
        })
    }

    fn reader(&self, key: &StreamKey) -> StorageResult<Box<dyn SegmentRead>> {
        let dir = self.segment_dir(key);

        // With no cached writer, holding the map keeps one from opening
        // (and trimming orphaned bytes) while the reader validates
        let writers = self.writers.lock()?;
        let cached = writers.peek(key).cloned();
        if let Some(shared) = cached {
            drop(writers);
            let _guard = shared.lock()?;
            return Ok(Box::new(SegmentReader::open(&dir)?));
        }

        if !dir.join(INDEX_FILE).exists() {
            return Ok(Box::new(EmptySegment));
        }
        Ok(Box::new(SegmentReader::open(&dir)?))
    }

    fn delete_substream(&self, key: &StreamKey) -> StorageResult<()> {
        self.evict_writers(|k| k == key)?;
        Self::remove_dir(&self.segment_dir(key))
    }

    fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()> {
        self.evict_writers(|k| k.in_stream(device, stream))?;
        Self::remove_dir(
            &self
                .root
                .join(device.to_string())
                .join(stream.to_string()),
        )
    }

    fn delete_device(&self, device: i64) -> StorageResult<()> {
        self.evict_writers(|k| k.device == device)?;
        Self::remove_dir(&self.root.join(device.to_string()))
    }

    fn clear(&self) -> StorageResult<()> {
        self.evict_writers(|_| true)?;
        Self::remove_dir(&self.root)?;
        std::fs::create_dir_all(&self.root)?;
        tracing::info!(path = %self.root.display(), "Cleared segment store");
        Ok(())
    }

    fn repair(&self, key: &StreamKey) -> StorageResult<u64> {
        self.evict_writers(|k| k == key)?;
        let dir = self.segment_dir(key);
        if !dir.join(INDEX_FILE).exists() {
            return Ok(0);
        }
        SegmentWriter::repair(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn points(range: std::ops::Range<u32>) -> Vec<Datapoint> {
        range
            .map(|i| Datapoint::new(i as f64, json!(i)))
            .collect()
    }

    fn store(dir: &Path) -> FileSegmentStore {
        FileSegmentStore::open(dir, CompressionType::Lz4, false).unwrap()
    }

    #[test]
    fn test_unknown_stream_is_empty() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = StreamKey::new(1, 1);

        assert_eq!(store.length(&key).unwrap(), 0);
        let mut reader = store.reader(&key).unwrap();
        assert!(reader.is_empty());
        assert_eq!(reader.find_time(10.0).unwrap(), TimeSearch::PastEnd(0));
        assert!(reader.read(0).is_err());
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = StreamKey::new(1, 2);
        store.create(&key).unwrap();
        store.create(&key).unwrap();
        assert_eq!(store.length(&key).unwrap(), 0);
        assert!(store.segment_dir(&key).join(INDEX_FILE).exists());
    }

    #[test]
    fn test_append_watermark() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = StreamKey::new(1, 1);

        assert_eq!(store.append(&key, 0, &points(0..5)).unwrap(), 5);
        // Retrying the same batch is a no-op
        assert_eq!(store.append(&key, 0, &points(0..5)).unwrap(), 0);
        assert_eq!(store.length(&key).unwrap(), 5);

        // Overlapping retry only writes the new tail
        assert_eq!(store.append(&key, 3, &points(3..8)).unwrap(), 3);
        assert_eq!(store.length(&key).unwrap(), 8);

        let err = store.append(&key, 10, &points(10..12)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::IndexGap {
                committed: 8,
                start: 10
            }
        ));

        let mut reader = store.reader(&key).unwrap();
        let all = reader.read_batch(0, 8).unwrap();
        let values: Vec<_> = all.iter().map(|d| d.data.clone()).collect();
        assert_eq!(values, (0..8).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_length_survives_reopen() {
        let dir = tempdir().unwrap();
        let key = StreamKey::substream(4, 2, "downlink");
        {
            let store = store(dir.path());
            store.append(&key, 0, &points(0..3)).unwrap();
        }
        let store = store(dir.path());
        assert_eq!(store.length(&key).unwrap(), 3);
        assert_eq!(store.reader(&key).unwrap().last_timestamp().unwrap(), Some(2.0));
    }

    #[test]
    fn test_find_time_range() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = StreamKey::new(1, 1);
        store.append(&key, 0, &points(1..7)).unwrap();

        let mut reader = store.reader(&key).unwrap();
        let span = reader.find_time_range(1.0, Some(4.0)).unwrap();
        assert_eq!(span, IndexSpan { start: 1, end: SpanEnd::Bounded(4) });

        let span = reader.find_time_range(2.0, Some(10.0)).unwrap();
        assert_eq!(span, IndexSpan { start: 2, end: SpanEnd::OpenTail });

        let span = reader.find_time_range(0.0, None).unwrap();
        assert_eq!(span, IndexSpan { start: 0, end: SpanEnd::OpenTail });

        assert!(matches!(
            reader.find_time_range(5.0, Some(4.0)),
            Err(StorageError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_substreams_are_disjoint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let primary = StreamKey::new(1, 1);
        let sub = StreamKey::substream(1, 1, "downlink");

        store.append(&primary, 0, &points(0..4)).unwrap();
        store.append(&sub, 0, &points(10..12)).unwrap();

        assert_eq!(store.length(&primary).unwrap(), 4);
        assert_eq!(store.length(&sub).unwrap(), 2);

        store.delete_substream(&sub).unwrap();
        assert_eq!(store.length(&sub).unwrap(), 0);
        assert_eq!(store.length(&primary).unwrap(), 4);
    }

    #[test]
    fn test_delete_stream_and_device() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let a = StreamKey::new(1, 1);
        let a_sub = StreamKey::substream(1, 1, "x");
        let b = StreamKey::new(1, 2);
        let c = StreamKey::new(2, 1);
        for key in [&a, &a_sub, &b, &c] {
            store.append(key, 0, &points(0..2)).unwrap();
        }

        store.delete_stream(1, 1).unwrap();
        assert_eq!(store.length(&a).unwrap(), 0);
        assert_eq!(store.length(&a_sub).unwrap(), 0);
        assert_eq!(store.length(&b).unwrap(), 2);

        store.delete_device(1).unwrap();
        assert_eq!(store.length(&b).unwrap(), 0);
        assert_eq!(store.length(&c).unwrap(), 2);

        // A deleted stream starts over from index 0
        assert_eq!(store.append(&a, 0, &points(0..1)).unwrap(), 1);

        store.clear().unwrap();
        assert_eq!(store.length(&c).unwrap(), 0);
        assert_eq!(store.length(&a).unwrap(), 0);
    }

    #[test]
    fn test_repair_through_store() {
        let dir = tempdir().unwrap();
        let key = StreamKey::new(1, 1);
        let index_path = {
            let store = store(dir.path());
            store.append(&key, 0, &points(0..3)).unwrap();
            store.segment_dir(&key).join(INDEX_FILE)
        };

        let len = std::fs::metadata(&index_path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&index_path).unwrap();
        file.set_len(len - 1).unwrap();
        drop(file);

        let store = store(dir.path());
        // Readers skip the torn entry, writers refuse the segment
        assert_eq!(store.reader(&key).unwrap().len(), 2);
        assert!(matches!(
            store.append(&key, 2, &points(2..3)),
            Err(StorageError::CorruptSegment(_))
        ));
        assert_eq!(store.repair(&key).unwrap(), 2);
        assert_eq!(store.length(&key).unwrap(), 2);
        assert_eq!(store.append(&key, 2, &points(2..3)).unwrap(), 1);
    }

    #[test]
    fn test_open_writers_are_bounded() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).with_max_open_writers(2);
        let keys: Vec<StreamKey> = (0..5).map(|s| StreamKey::new(1, s)).collect();

        for key in &keys {
            store.append(key, 0, &points(0..2)).unwrap();
        }
        assert_eq!(store.open_writers().unwrap(), 2);

        // A closed segment reopens where it left off
        assert_eq!(store.append(&keys[0], 2, &points(2..4)).unwrap(), 2);
        assert_eq!(store.open_writers().unwrap(), 2);
        for (i, key) in keys.iter().enumerate() {
            let expected = if i == 0 { 4 } else { 2 };
            assert_eq!(store.length(key).unwrap(), expected);
            let mut reader = store.reader(key).unwrap();
            assert_eq!(reader.read(1).unwrap().data, json!(1));
        }
    }

    #[test]
    fn test_evicted_writer_is_not_reused() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).with_max_open_writers(1);
        let a = StreamKey::new(1, 1);
        let b = StreamKey::new(1, 2);

        store.append(&a, 0, &points(0..1)).unwrap();
        let stale = store.writer(&a).unwrap();
        store.append(&b, 0, &points(0..1)).unwrap();
        assert!(stale.lock().unwrap().is_none());

        assert_eq!(store.append(&a, 1, &points(1..2)).unwrap(), 1);
        assert_eq!(store.length(&a).unwrap(), 2);
    }
}
