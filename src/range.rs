//! Read cursors over committed and pending datapoints
//!
//! A [`StreamRange`] covers an absolute index range `[start, end)` of one
//! stream. The part of that range still held by the batch cache is copied out
//! when the range opens; everything before it is read from the segment in
//! chunks as the cursor advances.
//!
//! The cache is read before the segment reader is opened. Batches are cleared
//! from the cache only after their commit, so whatever the cache no longer
//! holds is already visible to the reader and the two sides never leave a gap.

use crate::cache::BatchCache;
use crate::storage::{Datapoint, SegmentRead, SegmentStore, StorageError, StorageResult, StreamKey};
use std::collections::VecDeque;

/// Cursor over a run of datapoints in ascending index order
pub trait DataRange: Send {
    /// Absolute index of the next datapoint; the end index once exhausted
    fn index(&self) -> u64;

    /// Next datapoint, `None` at the end of the range
    fn next(&mut self) -> StorageResult<Option<Datapoint>>;

    /// Next contiguous run from one underlying chunk, `None` at the end
    fn next_array(&mut self) -> StorageResult<Option<Vec<Datapoint>>>;

    /// Release reader handles; idempotent
    fn close(&mut self);
}

/// A range with nothing in it
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRange {
    index: u64,
}

impl EmptyRange {
    /// Empty range positioned at `index`
    pub fn at(index: u64) -> Self {
        Self { index }
    }
}

impl DataRange for EmptyRange {
    fn index(&self) -> u64 {
        self.index
    }

    fn next(&mut self) -> StorageResult<Option<Datapoint>> {
        Ok(None)
    }

    fn next_array(&mut self) -> StorageResult<Option<Vec<Datapoint>>> {
        Ok(None)
    }

    fn close(&mut self) {}
}

/// Merged cursor over one stream's segment and cached tail
pub struct StreamRange {
    key: StreamKey,
    position: u64,
    end: u64,
    /// First index served from `cached`
    cached_from: u64,
    cached: VecDeque<Datapoint>,
    /// Segment records read ahead of `position`
    buffer: VecDeque<Datapoint>,
    reader: Option<Box<dyn SegmentRead>>,
    chunk_size: u64,
    closed: bool,
}

impl StreamRange {
    /// Open the python-style index range `[i1, i2)` of `key`
    ///
    /// The cache must already know the stream's committed length.
    pub fn open(
        cache: &dyn BatchCache,
        store: &dyn SegmentStore,
        key: &StreamKey,
        i1: i64,
        i2: i64,
        chunk_size: usize,
    ) -> StorageResult<Self> {
        let cached = cache.read_range(key, i1, i2)?;

        let reader = if cached.start < cached.cached_from {
            let reader = store.reader(key)?;
            if reader.len() < cached.cached_from {
                return Err(StorageError::CorruptSegment(format!(
                    "{}: segment holds {} records, cache expects at least {}",
                    key,
                    reader.len(),
                    cached.cached_from
                )));
            }
            Some(reader)
        } else {
            None
        };

        tracing::trace!(
            stream = %key,
            start = cached.start,
            end = cached.end,
            cached_from = cached.cached_from,
            "Opened range"
        );

        Ok(Self {
            key: key.clone(),
            position: cached.start,
            end: cached.end,
            cached_from: cached.cached_from,
            cached: cached.points.into(),
            buffer: VecDeque::new(),
            reader,
            chunk_size: chunk_size.max(1) as u64,
            closed: false,
        })
    }

    /// Index one past the last datapoint of the range
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Datapoints left to return
    pub fn remaining(&self) -> u64 {
        if self.closed {
            0
        } else {
            self.end - self.position
        }
    }

    /// Read the next segment chunk, stopping where the cached part begins
    fn read_segment_chunk(&mut self) -> StorageResult<Vec<Datapoint>> {
        let from = self.position + self.buffer.len() as u64;
        let to = (from + self.chunk_size).min(self.cached_from);

        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(StorageError::Closed),
        };

        let points = reader.read_batch(from, to)?;
        if points.len() as u64 != to - from {
            return Err(StorageError::OutOfRange {
                index: from as i64 + points.len() as i64,
                length: reader.len(),
            });
        }

        if to == self.cached_from {
            // Everything after comes from the cache
            self.release_reader();
        }
        Ok(points)
    }

    fn release_reader(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
    }
}

impl DataRange for StreamRange {
    fn index(&self) -> u64 {
        self.position
    }

    fn next(&mut self) -> StorageResult<Option<Datapoint>> {
        if self.closed || self.position >= self.end {
            return Ok(None);
        }

        if self.buffer.is_empty() && self.position < self.cached_from {
            let chunk = self.read_segment_chunk()?;
            self.buffer.extend(chunk);
        }

        let next = match self.buffer.pop_front() {
            Some(dp) => Some(dp),
            None => self.cached.pop_front(),
        };
        if next.is_some() {
            self.position += 1;
        }
        Ok(next)
    }

    fn next_array(&mut self) -> StorageResult<Option<Vec<Datapoint>>> {
        if self.closed || self.position >= self.end {
            return Ok(None);
        }

        let chunk: Vec<Datapoint> = if !self.buffer.is_empty() {
            self.buffer.drain(..).collect()
        } else if self.position < self.cached_from {
            self.read_segment_chunk()?
        } else {
            self.cached.drain(..).collect()
        };

        if chunk.is_empty() {
            return Ok(None);
        }
        self.position += chunk.len() as u64;
        Ok(Some(chunk))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_reader();
        self.buffer.clear();
        self.cached.clear();
        tracing::trace!(stream = %self.key, index = self.position, "Closed range");
    }
}

impl Drop for StreamRange {
    fn drop(&mut self) {
        self.close();
    }
}

/// Collect every remaining datapoint of a range, then close it
pub fn read_all(range: &mut dyn DataRange) -> StorageResult<Vec<Datapoint>> {
    let mut points = Vec::new();
    while let Some(chunk) = range.next_array()? {
        points.extend(chunk);
    }
    range.close();
    Ok(points)
}
