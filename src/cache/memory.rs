//! Process-local batch cache
//!
//! Lock order: `streams` map, then one stream's state, then the `usage` or
//! `queue` leaf locks. The queue lock is never held while a stream is locked
//! by the same thread in the other order.

use crate::cache::{resolve_range, BatchCache, CacheRange, CacheStats, CachedSearch};
use crate::config::CacheConfig;
use crate::storage::{
    encoded_size, to_nanos, Batch, Datapoint, DatapointSlice, QuotaScope, StorageError,
    StorageResult, StreamKey, TimeSearch,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Location of a batch inside its stream's pending queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchRef {
    key: StreamKey,
    start: u64,
    end: u64,
}

impl From<&Batch> for BatchRef {
    fn from(batch: &Batch) -> Self {
        Self {
            key: batch.key.clone(),
            start: batch.start_index,
            end: batch.end_index(),
        }
    }
}

#[derive(Default)]
struct StreamState {
    /// Uncleared datapoints with their encoded sizes, starting at `start`
    pending: VecDeque<(Datapoint, u64)>,
    start: u64,
    /// First index not yet assigned to a batch
    batch_index: u64,
    end_time: Option<f64>,
    /// Committed spans cleared ahead of their predecessors, by start index
    cleared: BTreeMap<u64, u64>,
}

impl StreamState {
    fn seeded(length: u64, end_time: Option<f64>) -> Self {
        Self {
            start: length,
            batch_index: length,
            end_time,
            ..Default::default()
        }
    }

    fn length(&self) -> u64 {
        self.start + self.pending.len() as u64
    }

    fn slice(&self, from: u64, to: u64) -> Vec<Datapoint> {
        let from = from.saturating_sub(self.start) as usize;
        let to = to.saturating_sub(self.start) as usize;
        self.pending
            .range(from..to.min(self.pending.len()))
            .map(|(dp, _)| dp.clone())
            .collect()
    }

    /// Drop `[start, end)` from the front; returns bytes released
    fn pop_front(&mut self, end: u64) -> u64 {
        let mut released = 0;
        while self.start < end {
            match self.pending.pop_front() {
                Some((_, size)) => released += size,
                None => break,
            }
            self.start += 1;
        }
        released
    }

    fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|(_, size)| size).sum()
    }
}

#[derive(Default)]
struct Usage {
    devices: HashMap<i64, u64>,
    streams: HashMap<(i64, i64), u64>,
    pending_bytes: u64,
}

#[derive(Default)]
struct BatchQueue {
    ready: VecDeque<BatchRef>,
    processing: HashSet<BatchRef>,
}

/// In-memory [`BatchCache`]
pub struct MemoryCache {
    batch_size: u64,
    max_pending_bytes: u64,
    restamp_epsilon: f64,
    streams: RwLock<HashMap<StreamKey, Arc<Mutex<StreamState>>>>,
    usage: Mutex<Usage>,
    queue: Mutex<BatchQueue>,
    closed: AtomicBool,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1) as u64,
            max_pending_bytes: config.max_pending_bytes,
            restamp_epsilon: config.restamp_epsilon,
            streams: RwLock::new(HashMap::new()),
            usage: Mutex::new(Usage::default()),
            queue: Mutex::new(BatchQueue::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Cache with default limits and the given batch size
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self::new(&CacheConfig {
            batch_size,
            ..CacheConfig::default()
        })
    }

    fn state(&self, key: &StreamKey) -> StorageResult<Option<Arc<Mutex<StreamState>>>> {
        Ok(self.streams.read()?.get(key).cloned())
    }

    fn state_or_insert(
        &self,
        key: &StreamKey,
        init: impl FnOnce() -> StreamState,
    ) -> StorageResult<(Arc<Mutex<StreamState>>, bool)> {
        if let Some(state) = self.state(key)? {
            return Ok((state, false));
        }
        let mut streams = self.streams.write()?;
        if let Some(state) = streams.get(key) {
            return Ok((Arc::clone(state), false));
        }
        let state = Arc::new(Mutex::new(init()));
        streams.insert(key.clone(), Arc::clone(&state));
        Ok((state, true))
    }

    fn restamp(&self, points: &mut [Datapoint], mut previous: Option<f64>) {
        for dp in points.iter_mut() {
            if let Some(prev) = previous {
                if dp.timestamp <= prev {
                    dp.timestamp = prev + self.restamp_epsilon;
                }
            }
            previous = Some(dp.timestamp);
        }
    }

    fn materialize(&self, refs: Vec<BatchRef>) -> StorageResult<Vec<Batch>> {
        let mut batches = Vec::with_capacity(refs.len());
        for batch_ref in refs {
            let data = match self.state(&batch_ref.key)? {
                Some(state) => {
                    let state = state.lock()?;
                    if batch_ref.start < state.start || batch_ref.end > state.length() {
                        None
                    } else {
                        Some(state.slice(batch_ref.start, batch_ref.end))
                    }
                }
                None => None,
            };

            match data {
                Some(data) => batches.push(Batch::new(batch_ref.key, batch_ref.start, data)),
                None => {
                    tracing::debug!(stream = %batch_ref.key, start = batch_ref.start, "Dropping batch of purged stream");
                    self.queue.lock()?.processing.remove(&batch_ref);
                }
            }
        }
        Ok(batches)
    }

    /// Remove stream states matching `pred` along with their queued batches
    fn purge(&self, pred: impl Fn(&StreamKey) -> bool) -> StorageResult<()> {
        let removed: Vec<(StreamKey, Arc<Mutex<StreamState>>)> = {
            let mut streams = self.streams.write()?;
            let keys: Vec<StreamKey> = streams.keys().filter(|k| pred(k)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| streams.remove(&k).map(|s| (k, s)))
                .collect()
        };

        let mut released = 0;
        for (_, state) in &removed {
            released += state.lock()?.pending_bytes();
        }

        {
            let mut usage = self.usage.lock()?;
            usage.pending_bytes = usage.pending_bytes.saturating_sub(released);
        }

        let mut queue = self.queue.lock()?;
        queue.ready.retain(|b| !pred(&b.key));
        queue.processing.retain(|b| !pred(&b.key));

        Ok(())
    }
}

impl BatchCache for MemoryCache {
    fn stream_length(&self, key: &StreamKey) -> StorageResult<u64> {
        match self.state(key)? {
            Some(state) => Ok(state.lock()?.length()),
            None => Ok(0),
        }
    }

    fn device_size(&self, device: i64) -> StorageResult<u64> {
        Ok(self.usage.lock()?.devices.get(&device).copied().unwrap_or(0))
    }

    fn stream_size(&self, key: &StreamKey) -> StorageResult<u64> {
        Ok(self
            .usage
            .lock()?
            .streams
            .get(&(key.device, key.stream))
            .copied()
            .unwrap_or(0))
    }

    fn contains(&self, key: &StreamKey) -> StorageResult<bool> {
        Ok(self.streams.read()?.contains_key(key))
    }

    fn seed(
        &self,
        key: &StreamKey,
        length: u64,
        end_time: Option<f64>,
        size: u64,
    ) -> StorageResult<()> {
        let (_, created) = self.state_or_insert(key, || StreamState::seeded(length, end_time))?;
        if created && size > 0 {
            let mut usage = self.usage.lock()?;
            *usage.devices.entry(key.device).or_insert(0) += size;
            *usage.streams.entry((key.device, key.stream)).or_insert(0) += size;
        }
        Ok(())
    }

    fn insert(
        &self,
        key: &StreamKey,
        mut points: Vec<Datapoint>,
        restamp: bool,
        max_device_size: u64,
        max_stream_size: u64,
    ) -> StorageResult<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if let Some(i) = points.iter().position(|dp| !dp.timestamp.is_finite()) {
            return Err(StorageError::Validation(format!(
                "datapoint {}: timestamp must be finite",
                i
            )));
        }

        let (state, _) = self.state_or_insert(key, StreamState::default)?;
        let mut state = state.lock()?;

        if points.is_empty() {
            return Ok(state.length());
        }

        if restamp {
            self.restamp(&mut points, state.end_time);
        } else {
            let behind = match (state.end_time, points.first()) {
                (Some(end), Some(first)) => first.timestamp < end,
                _ => false,
            };
            if behind || !points.is_timestamp_ordered() {
                return Err(StorageError::TimestampOrder);
            }
        }

        let sizes = points
            .iter()
            .map(encoded_size)
            .collect::<StorageResult<Vec<u64>>>()?;
        let incoming: u64 = sizes.iter().sum();

        {
            let mut usage = self.usage.lock()?;
            let device_size = usage.devices.get(&key.device).copied().unwrap_or(0);
            let stream_size = usage
                .streams
                .get(&(key.device, key.stream))
                .copied()
                .unwrap_or(0);

            if max_device_size > 0 && device_size + incoming > max_device_size {
                return Err(StorageError::QuotaExceeded {
                    scope: QuotaScope::Device,
                    size: device_size,
                    incoming,
                    limit: max_device_size,
                });
            }
            if max_stream_size > 0 && stream_size + incoming > max_stream_size {
                return Err(StorageError::QuotaExceeded {
                    scope: QuotaScope::Stream,
                    size: stream_size,
                    incoming,
                    limit: max_stream_size,
                });
            }
            if self.max_pending_bytes > 0 && usage.pending_bytes + incoming > self.max_pending_bytes
            {
                return Err(StorageError::Backpressure {
                    pending: usage.pending_bytes,
                    limit: self.max_pending_bytes,
                });
            }

            *usage.devices.entry(key.device).or_insert(0) += incoming;
            *usage.streams.entry((key.device, key.stream)).or_insert(0) += incoming;
            usage.pending_bytes += incoming;
        }

        state.end_time = points.last().map(|dp| dp.timestamp);
        state.pending.extend(points.into_iter().zip(sizes));

        let length = state.length();
        let mut ready = Vec::new();
        while length - state.batch_index >= self.batch_size {
            let start = state.batch_index;
            state.batch_index += self.batch_size;
            ready.push(BatchRef {
                key: key.clone(),
                start,
                end: state.batch_index,
            });
        }
        if !ready.is_empty() {
            self.queue.lock()?.ready.extend(ready);
        }

        Ok(length)
    }

    fn delete_device(&self, device: i64) -> StorageResult<()> {
        self.purge(|k| k.device == device)?;
        let mut usage = self.usage.lock()?;
        usage.devices.remove(&device);
        usage.streams.retain(|(d, _), _| *d != device);
        Ok(())
    }

    fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()> {
        self.purge(|k| k.in_stream(device, stream))?;
        let mut usage = self.usage.lock()?;
        if let Some(size) = usage.streams.remove(&(device, stream)) {
            if let Some(total) = usage.devices.get_mut(&device) {
                *total = total.saturating_sub(size);
            }
        }
        Ok(())
    }

    fn delete_substream(&self, key: &StreamKey) -> StorageResult<()> {
        self.purge(|k| k == key)
    }

    fn read_processing_queue(&self) -> StorageResult<Vec<Batch>> {
        self.read_batches(usize::MAX)
    }

    fn read_batches(&self, n: usize) -> StorageResult<Vec<Batch>> {
        let refs: Vec<BatchRef> = {
            let mut queue = self.queue.lock()?;
            let take = n.min(queue.ready.len());
            let refs: Vec<BatchRef> = queue.ready.drain(..take).collect();
            queue.processing.extend(refs.iter().cloned());
            refs
        };
        self.materialize(refs)
    }

    fn release_batches(&self, batches: &[Batch]) -> StorageResult<()> {
        let mut queue = self.queue.lock()?;
        for batch in batches.iter().rev() {
            let batch_ref = BatchRef::from(batch);
            if queue.processing.remove(&batch_ref) {
                queue.ready.push_front(batch_ref);
            }
        }
        Ok(())
    }

    fn flush_pending(&self) -> StorageResult<usize> {
        let states: Vec<(StreamKey, Arc<Mutex<StreamState>>)> = self
            .streams
            .read()?
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut sealed = Vec::new();
        for (key, state) in states {
            let mut state = state.lock()?;
            let length = state.length();
            if length > state.batch_index {
                sealed.push(BatchRef {
                    key,
                    start: state.batch_index,
                    end: length,
                });
                state.batch_index = length;
            }
        }

        let count = sealed.len();
        if count > 0 {
            self.queue.lock()?.ready.extend(sealed);
        }
        Ok(count)
    }

    fn read_range(&self, key: &StreamKey, i1: i64, i2: i64) -> StorageResult<CacheRange> {
        let state = match self.state(key)? {
            Some(state) => state,
            None => {
                let (start, end) = resolve_range(i1, i2, 0)?;
                return Ok(CacheRange {
                    start,
                    end,
                    cached_from: end,
                    points: Vec::new(),
                });
            }
        };

        let state = state.lock()?;
        let (start, end) = resolve_range(i1, i2, state.length())?;
        let cached_from = state.start.clamp(start, end);

        Ok(CacheRange {
            start,
            end,
            cached_from,
            points: state.slice(cached_from, end),
        })
    }

    fn find_time(&self, key: &StreamKey, t: f64) -> StorageResult<CachedSearch> {
        let state = match self.state(key)? {
            Some(state) => state,
            None => {
                return Ok(CachedSearch {
                    cached_from: 0,
                    search: TimeSearch::PastEnd(0),
                })
            }
        };

        let state = state.lock()?;
        let target = to_nanos(t);
        let offset = state
            .pending
            .partition_point(|(dp, _)| dp.timestamp_nanos() <= target);

        let index = state.start + offset as u64;
        let search = if index >= state.length() {
            TimeSearch::PastEnd(state.length())
        } else {
            TimeSearch::Found(index)
        };

        Ok(CachedSearch {
            cached_from: state.start,
            search,
        })
    }

    fn clear_batches(&self, batches: &[Batch]) -> StorageResult<()> {
        for batch in batches {
            let batch_ref = BatchRef::from(batch);

            if let Some(state) = self.state(&batch.key)? {
                let mut guard = state.lock()?;
                let state = &mut *guard;
                let mut released = 0;

                if batch_ref.end <= state.start {
                    // already cleared
                } else if batch_ref.start <= state.start {
                    released += state.pop_front(batch_ref.end);
                    while let Some(end) = state.cleared.remove(&state.start) {
                        released += state.pop_front(end);
                    }
                } else {
                    state.cleared.insert(batch_ref.start, batch_ref.end);
                }

                if released > 0 {
                    let mut usage = self.usage.lock()?;
                    usage.pending_bytes = usage.pending_bytes.saturating_sub(released);
                }
            }

            self.queue.lock()?.processing.remove(&batch_ref);
        }
        Ok(())
    }

    fn stats(&self) -> StorageResult<CacheStats> {
        let states: Vec<Arc<Mutex<StreamState>>> =
            self.streams.read()?.values().cloned().collect();

        let mut pending_points = 0;
        for state in &states {
            pending_points += state.lock()?.pending.len() as u64;
        }

        let pending_bytes = self.usage.lock()?.pending_bytes;
        let queue = self.queue.lock()?;

        Ok(CacheStats {
            streams: states.len(),
            ready_batches: queue.ready.len(),
            processing_batches: queue.processing.len(),
            pending_points,
            pending_bytes,
        })
    }

    fn clear(&self) -> StorageResult<()> {
        self.streams.write()?.clear();
        *self.usage.lock()? = Usage::default();
        *self.queue.lock()? = BatchQueue::default();
        tracing::info!("Cleared batch cache");
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn points(timestamps: &[f64]) -> Vec<Datapoint> {
        timestamps
            .iter()
            .map(|t| Datapoint::new(*t, json!(t)))
            .collect()
    }

    fn timestamps(points: &[Datapoint]) -> Vec<f64> {
        points.iter().map(|dp| dp.timestamp).collect()
    }

    #[test]
    fn test_batches_form_at_threshold() {
        let cache = MemoryCache::with_batch_size(2);
        let key = StreamKey::new(1, 1);

        let length = cache
            .insert(&key, points(&[1.0, 2.0, 3.0, 4.0, 5.0]), false, 0, 0)
            .unwrap();
        assert_eq!(length, 5);

        let batches = cache.read_processing_queue().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(timestamps(&batches[0].data), vec![1.0, 2.0]);
        assert_eq!(timestamps(&batches[1].data), vec![3.0, 4.0]);
        assert_eq!(batches[1].start_index, 2);

        // Each batch is claimed exactly once
        assert!(cache.read_processing_queue().unwrap().is_empty());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.processing_batches, 2);
        assert_eq!(stats.pending_points, 5);

        cache.clear_batches(&batches).unwrap();
        let range = cache.read_range(&key, 0, 0).unwrap();
        assert_eq!((range.start, range.end, range.cached_from), (0, 5, 4));
        assert_eq!(timestamps(&range.points), vec![5.0]);
        assert_eq!(cache.stats().unwrap().pending_batches(), 0);
    }

    #[test]
    fn test_read_batches_pages() {
        let cache = MemoryCache::with_batch_size(1);
        let key = StreamKey::new(1, 1);
        cache
            .insert(&key, points(&[1.0, 2.0, 3.0]), false, 0, 0)
            .unwrap();

        let first = cache.read_batches(2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = cache.read_batches(2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].start_index, 2);
    }

    #[test]
    fn test_release_returns_batches_to_front() {
        let cache = MemoryCache::with_batch_size(1);
        let key = StreamKey::new(1, 1);
        cache
            .insert(&key, points(&[1.0, 2.0, 3.0]), false, 0, 0)
            .unwrap();

        let claimed = cache.read_batches(2).unwrap();
        cache.release_batches(&claimed).unwrap();

        let again = cache.read_processing_queue().unwrap();
        let starts: Vec<u64> = again.iter().map(|b| b.start_index).collect();
        assert_eq!(starts, vec![0, 1, 2]);
    }

    #[test]
    fn test_clear_is_idempotent_and_ordered() {
        let cache = MemoryCache::with_batch_size(2);
        let key = StreamKey::new(1, 1);
        cache
            .insert(&key, points(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), false, 0, 0)
            .unwrap();
        let batches = cache.read_processing_queue().unwrap();
        assert_eq!(batches.len(), 3);

        // Clearing a later batch first holds it until its predecessor clears
        cache.clear_batches(&batches[1..2]).unwrap();
        assert_eq!(cache.read_range(&key, 0, 0).unwrap().cached_from, 0);

        cache.clear_batches(&batches[0..1]).unwrap();
        assert_eq!(cache.read_range(&key, 0, 0).unwrap().cached_from, 4);

        let before = cache.stats().unwrap();
        cache.clear_batches(&batches[0..2]).unwrap();
        assert_eq!(cache.stats().unwrap(), before);
        assert_eq!(cache.stream_length(&key).unwrap(), 6);
    }

    #[test]
    fn test_flush_pending_seals_tails() {
        let cache = MemoryCache::with_batch_size(10);
        let a = StreamKey::new(1, 1);
        let b = StreamKey::substream(1, 1, "x");
        cache.insert(&a, points(&[1.0, 2.0]), false, 0, 0).unwrap();
        cache.insert(&b, points(&[1.0]), false, 0, 0).unwrap();

        assert!(cache.read_processing_queue().unwrap().is_empty());
        assert_eq!(cache.flush_pending().unwrap(), 2);
        assert_eq!(cache.flush_pending().unwrap(), 0);

        let batches = cache.read_processing_queue().unwrap();
        assert_eq!(batches.len(), 2);

        // Later inserts start a fresh batch after the sealed tail
        cache.insert(&a, points(&[3.0]), false, 0, 0).unwrap();
        cache.flush_pending().unwrap();
        let next = cache.read_processing_queue().unwrap();
        assert_eq!(next[0].start_index, 2);
    }

    #[test]
    fn test_timestamp_order_rejected() {
        let cache = MemoryCache::with_batch_size(10);
        let key = StreamKey::new(1, 1);
        cache.insert(&key, points(&[5.0, 6.0]), false, 0, 0).unwrap();

        assert!(matches!(
            cache.insert(&key, points(&[4.0]), false, 0, 0),
            Err(StorageError::TimestampOrder)
        ));
        assert!(matches!(
            cache.insert(&key, points(&[7.0, 6.5]), false, 0, 0),
            Err(StorageError::TimestampOrder)
        ));
        // Ties are allowed
        assert_eq!(cache.insert(&key, points(&[6.0]), false, 0, 0).unwrap(), 3);
    }

    #[test]
    fn test_non_finite_timestamp_rejected() {
        let cache = MemoryCache::with_batch_size(10);
        let key = StreamKey::new(1, 1);
        cache.insert(&key, points(&[1.0]), false, 0, 0).unwrap();

        assert!(matches!(
            cache.insert(&key, points(&[f64::NAN]), false, 0, 0),
            Err(StorageError::Validation(_))
        ));
        let err = cache
            .insert(&key, points(&[2.0, f64::NAN]), true, 0, 0)
            .unwrap_err();
        assert!(matches!(&err, StorageError::Validation(msg) if msg.starts_with("datapoint 1")));
        assert!(cache
            .insert(&key, points(&[f64::INFINITY]), true, 0, 0)
            .is_err());

        // Nothing was admitted, ordering against 1.0 still holds
        assert_eq!(cache.insert(&key, points(&[1.5]), false, 0, 0).unwrap(), 2);
        assert!(matches!(
            cache.insert(&key, points(&[1.2]), false, 0, 0),
            Err(StorageError::TimestampOrder)
        ));
    }

    #[test]
    fn test_restamp_moves_forward_only() {
        let cache = MemoryCache::with_batch_size(10);
        let key = StreamKey::new(1, 1);
        cache.insert(&key, points(&[10.0]), true, 0, 0).unwrap();
        cache
            .insert(&key, points(&[5.0, 10.0, 20.0, 20.0]), true, 0, 0)
            .unwrap();

        let stored = cache.read_range(&key, 0, 0).unwrap().points;
        let ts = timestamps(&stored);
        assert_eq!(ts[0], 10.0);
        assert_eq!(ts[1], 10.0 + 1e-6);
        assert_eq!(ts[2], ts[1] + 1e-6);
        assert_eq!(ts[3], 20.0);
        assert_eq!(ts[4], 20.0 + 1e-6);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        // Values keep their original order
        assert_eq!(stored[1].data, json!(5.0));
    }

    #[test]
    fn test_device_quota_rejects_without_mutation() {
        let cache = MemoryCache::with_batch_size(10);
        let key = StreamKey::new(1, 1);
        cache.insert(&key, points(&[1.0]), false, 0, 0).unwrap();
        let size = cache.device_size(1).unwrap();
        assert!(size > 0);

        let err = cache
            .insert(&key, points(&[2.0]), false, size, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::QuotaExceeded {
                scope: QuotaScope::Device,
                ..
            }
        ));
        assert_eq!(cache.stream_length(&key).unwrap(), 1);
        assert_eq!(cache.device_size(1).unwrap(), size);
    }

    #[test]
    fn test_stream_quota_spans_substreams() {
        let cache = MemoryCache::with_batch_size(10);
        let primary = StreamKey::new(1, 1);
        let sub = StreamKey::substream(1, 1, "x");
        let other = StreamKey::new(1, 2);

        cache.insert(&primary, points(&[1.0]), false, 0, 0).unwrap();
        let one = cache.stream_size(&primary).unwrap();
        cache.insert(&sub, points(&[1.0]), false, 0, 0).unwrap();
        assert_eq!(cache.stream_size(&primary).unwrap(), 2 * one);
        assert_eq!(cache.stream_size(&sub).unwrap(), 2 * one);

        assert!(matches!(
            cache.insert(&sub, points(&[2.0]), false, 0, 2 * one),
            Err(StorageError::QuotaExceeded {
                scope: QuotaScope::Stream,
                ..
            })
        ));
        // A sibling stream has its own cap
        cache.insert(&other, points(&[1.0]), false, 0, 2 * one).unwrap();
        assert_eq!(cache.device_size(1).unwrap(), 3 * one);
    }

    #[test]
    fn test_backpressure() {
        let cache = MemoryCache::new(&CacheConfig {
            batch_size: 10,
            max_pending_bytes: 1,
            ..CacheConfig::default()
        });
        let key = StreamKey::new(1, 1);
        assert!(matches!(
            cache.insert(&key, points(&[1.0]), false, 0, 0),
            Err(StorageError::Backpressure { .. })
        ));
        assert_eq!(cache.stream_length(&key).unwrap(), 0);
    }

    #[test]
    fn test_seed_and_read_range() {
        let cache = MemoryCache::with_batch_size(10);
        let key = StreamKey::new(1, 1);
        cache.seed(&key, 100, Some(50.0), 4096).unwrap();
        cache.seed(&key, 7, None, 1).unwrap();

        assert_eq!(cache.stream_length(&key).unwrap(), 100);
        assert_eq!(cache.device_size(1).unwrap(), 4096);
        assert!(cache.insert(&key, points(&[49.0]), false, 0, 0).is_err());
        cache.insert(&key, points(&[51.0, 52.0]), false, 0, 0).unwrap();

        let range = cache.read_range(&key, -3, 0).unwrap();
        assert_eq!((range.start, range.end, range.cached_from), (99, 102, 100));
        assert_eq!(timestamps(&range.points), vec![51.0, 52.0]);

        let range = cache.read_range(&key, 10, 20).unwrap();
        assert_eq!(range.cached_from, 20);
        assert!(range.points.is_empty());

        assert!(cache.read_range(&key, 103, 0).is_err());
    }

    #[test]
    fn test_find_time_over_cached_window() {
        let cache = MemoryCache::with_batch_size(2);
        let key = StreamKey::new(1, 1);
        cache
            .insert(&key, points(&[1.0, 2.0, 3.0, 4.0, 5.0]), false, 0, 0)
            .unwrap();
        let batches = cache.read_batches(1).unwrap();
        cache.clear_batches(&batches).unwrap();

        let found = cache.find_time(&key, 3.0).unwrap();
        assert_eq!(found.cached_from, 2);
        assert_eq!(found.search, TimeSearch::Found(3));
        assert_eq!(cache.find_time(&key, 0.0).unwrap().search, TimeSearch::Found(2));
        assert_eq!(cache.find_time(&key, 5.0).unwrap().search, TimeSearch::PastEnd(5));

        let unknown = cache.find_time(&StreamKey::new(9, 9), 1.0).unwrap();
        assert_eq!(unknown.search, TimeSearch::PastEnd(0));
    }

    #[test]
    fn test_delete_purges_bookkeeping() {
        let cache = MemoryCache::with_batch_size(1);
        let a = StreamKey::new(1, 1);
        let b = StreamKey::new(1, 2);
        cache.insert(&a, points(&[1.0]), false, 0, 0).unwrap();
        cache.insert(&b, points(&[1.0]), false, 0, 0).unwrap();
        let per_stream = cache.stream_size(&a).unwrap();

        cache.delete_stream(1, 1).unwrap();
        assert!(!cache.contains(&a).unwrap());
        assert_eq!(cache.device_size(1).unwrap(), per_stream);
        let remaining = cache.read_processing_queue().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, b);

        cache.delete_device(1).unwrap();
        assert_eq!(cache.device_size(1).unwrap(), 0);
        assert_eq!(cache.stats().unwrap().streams, 0);
        assert_eq!(cache.stats().unwrap().pending_bytes, 0);
    }

    #[test]
    fn test_close_rejects_inserts() {
        let cache = MemoryCache::with_batch_size(1);
        let key = StreamKey::new(1, 1);
        cache.insert(&key, points(&[1.0]), false, 0, 0).unwrap();
        cache.close().unwrap();
        assert!(cache.is_closed());
        assert!(matches!(
            cache.insert(&key, points(&[2.0]), false, 0, 0),
            Err(StorageError::Closed)
        ));
        // Pending data is still claimable for the final flush
        assert_eq!(cache.read_processing_queue().unwrap().len(), 1);

        cache.clear().unwrap();
        assert_eq!(cache.stream_length(&key).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_inserts_on_different_keys() {
        let cache = Arc::new(MemoryCache::with_batch_size(5));
        let handles: Vec<_> = (0..4)
            .map(|stream| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let key = StreamKey::new(1, stream);
                    for i in 0..50 {
                        cache
                            .insert(&key, points(&[i as f64]), false, 0, 0)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for stream in 0..4 {
            assert_eq!(cache.stream_length(&StreamKey::new(1, stream)).unwrap(), 50);
        }
        assert_eq!(cache.read_processing_queue().unwrap().len(), 40);
    }
}
