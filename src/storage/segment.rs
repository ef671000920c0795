//! Segment file format for timebatch storage
//!
//! Each stream owns one segment: a directory holding an append-only payload
//! log and a fixed-width index over it.
//!
//! Layout:
//! ```text
//! index
//! ┌─────────────────────────────────────────┐
//! │ HEADER (16 bytes)                       │
//! │   magic: [u8; 4] = "TBSX"               │
//! │   version: u16                          │
//! │   reserved: [u8; 6]                     │
//! │   checksum: u32 (crc32 of bytes 0..12)  │
//! ├─────────────────────────────────────────┤
//! │ ENTRIES (24 bytes each)                 │
//! │   timestamp_nanos: i64                  │
//! │   offset: u64                           │
//! │   length: u32                           │
//! │   checksum: u32 (crc32 of payload)      │
//! └─────────────────────────────────────────┘
//!
//! data
//! ┌─────────────────────────────────────────┐
//! │ payload | payload | payload | ...       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Payloads are written before their index entries, so an index entry is the
//! proof that a record was committed. Data bytes past the last entry belong to
//! a batch that never finished and are discarded when a writer opens.

use crate::storage::codec::decode_datapoint;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::SegmentRead;
use crate::storage::types::{to_nanos, Datapoint, TimeSearch};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for index file identification
const INDEX_MAGIC: [u8; 4] = *b"TBSX";

/// Current segment format version
const INDEX_VERSION: u16 = 1;

/// Index header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Index entry size in bytes
pub const ENTRY_SIZE: usize = 24;

pub const INDEX_FILE: &str = "index";
pub const DATA_FILE: &str = "data";

fn header_bytes() -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&INDEX_MAGIC);
    buf[4..6].copy_from_slice(&INDEX_VERSION.to_le_bytes());
    // bytes 6-11 reserved
    let checksum = crc32fast::hash(&buf[0..12]);
    buf[12..16].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn check_header(buf: &[u8; HEADER_SIZE]) -> StorageResult<()> {
    let stored_checksum = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let computed_checksum = crc32fast::hash(&buf[0..12]);

    if stored_checksum != computed_checksum {
        return Err(StorageError::CorruptSegment(format!(
            "Header checksum mismatch: stored={}, computed={}",
            stored_checksum, computed_checksum
        )));
    }

    if buf[0..4] != INDEX_MAGIC {
        return Err(StorageError::InvalidSegment(format!(
            "Invalid magic: {:?}",
            &buf[0..4]
        )));
    }

    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version > INDEX_VERSION {
        return Err(StorageError::InvalidSegment(format!(
            "Unsupported version: {}",
            version
        )));
    }

    Ok(())
}

/// One fixed-width index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub offset: u64,
    pub length: u32,
    pub checksum: u32,
}

impl IndexEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.length.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut ts = [0u8; 8];
        let mut offset = [0u8; 8];
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        ts.copy_from_slice(&buf[0..8]);
        offset.copy_from_slice(&buf[8..16]);
        length.copy_from_slice(&buf[16..20]);
        checksum.copy_from_slice(&buf[20..24]);
        Self {
            timestamp: i64::from_le_bytes(ts),
            offset: u64::from_le_bytes(offset),
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }

    /// Data file offset one past this entry's payload
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

fn entry_position(index: u64) -> u64 {
    HEADER_SIZE as u64 + index * ENTRY_SIZE as u64
}

fn read_entry(file: &mut File, index: u64) -> StorageResult<IndexEntry> {
    let mut buf = [0u8; ENTRY_SIZE];
    file.seek(SeekFrom::Start(entry_position(index)))?;
    file.read_exact(&mut buf)?;
    Ok(IndexEntry::from_bytes(&buf))
}

/// How a partial trailing index entry is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TornTail {
    /// Corruption; only `repair` may drop it
    Reject,
    /// An append in flight; entries before it are complete
    Ignore,
}

/// Check an index file of `index_len` bytes and return its record count
///
/// Fails with `CorruptSegment` on a bad header, a rejected partial trailing
/// entry, or a last entry pointing past the end of the data file.
fn validate(
    index: &mut File,
    index_len: u64,
    data_len: u64,
    path: &Path,
    torn: TornTail,
) -> StorageResult<u64> {
    if index_len < HEADER_SIZE as u64 {
        return Err(StorageError::CorruptSegment(format!(
            "{}: truncated header",
            path.display()
        )));
    }

    let mut header = [0u8; HEADER_SIZE];
    index.seek(SeekFrom::Start(0))?;
    index.read_exact(&mut header)?;
    check_header(&header)?;

    let body = index_len - HEADER_SIZE as u64;
    if body % ENTRY_SIZE as u64 != 0 && torn == TornTail::Reject {
        return Err(StorageError::CorruptSegment(format!(
            "{}: torn index entry ({} trailing bytes)",
            path.display(),
            body % ENTRY_SIZE as u64
        )));
    }

    let count = body / ENTRY_SIZE as u64;
    if count > 0 {
        let last = read_entry(index, count - 1)?;
        if last.end() > data_len {
            return Err(StorageError::CorruptSegment(format!(
                "{}: entry {} references byte {} of a {} byte data file",
                path.display(),
                count - 1,
                last.end(),
                data_len
            )));
        }
    }

    Ok(count)
}

/// Appends records to one segment
///
/// Records are buffered by [`batch_insert`](Self::batch_insert) and made
/// durable together by [`batch_write`](Self::batch_write).
pub struct SegmentWriter {
    dir: PathBuf,
    index: File,
    data: File,
    committed: u64,
    data_len: u64,
    last_timestamp: Option<i64>,
    pending: Vec<(i64, Vec<u8>)>,
    sync: bool,
}

impl SegmentWriter {
    /// Open a segment for appending, creating it if needed
    pub fn open(dir: impl AsRef<Path>, sync: bool) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let mut index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&index_path)?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE))?;

        // A crash while creating the segment leaves an empty index
        if index.metadata()?.len() == 0 {
            index.write_all(&header_bytes())?;
            index.sync_all()?;
        }

        let index_len = index.metadata()?.len();
        let mut data_len = data.metadata()?.len();
        let committed = validate(&mut index, index_len, data_len, &index_path, TornTail::Reject)?;

        let (expected_len, last_timestamp) = if committed > 0 {
            let last = read_entry(&mut index, committed - 1)?;
            (last.end(), Some(last.timestamp))
        } else {
            (0, None)
        };

        if data_len > expected_len {
            tracing::warn!(
                segment = %dir.display(),
                orphaned = data_len - expected_len,
                "Discarding data bytes from an unfinished batch"
            );
            data.set_len(expected_len)?;
            data.sync_all()?;
            data_len = expected_len;
        }

        Ok(Self {
            dir,
            index,
            data,
            committed,
            data_len,
            last_timestamp,
            pending: Vec::new(),
            sync,
        })
    }

    /// Truncate a torn index tail and orphaned data so the segment opens again
    ///
    /// Returns the number of records that survive.
    pub fn repair(dir: impl AsRef<Path>) -> StorageResult<u64> {
        let dir = dir.as_ref();
        let index_path = dir.join(INDEX_FILE);
        let mut index = OpenOptions::new().read(true).write(true).open(&index_path)?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE))?;

        let index_len = index.metadata()?.len();
        if index_len < HEADER_SIZE as u64 {
            index.set_len(0)?;
            index.write_all(&header_bytes())?;
        } else {
            let mut header = [0u8; HEADER_SIZE];
            index.seek(SeekFrom::Start(0))?;
            index.read_exact(&mut header)?;
            check_header(&header)?;
        }

        let data_len = data.metadata()?.len();
        let index_len = index.metadata()?.len();
        let mut count = (index_len - HEADER_SIZE as u64) / ENTRY_SIZE as u64;

        while count > 0 && read_entry(&mut index, count - 1)?.end() > data_len {
            count -= 1;
        }
        let data_end = if count > 0 {
            read_entry(&mut index, count - 1)?.end()
        } else {
            0
        };

        index.set_len(entry_position(count))?;
        data.set_len(data_end)?;
        index.sync_all()?;
        data.sync_all()?;

        tracing::warn!(
            segment = %dir.display(),
            records = count,
            "Segment repaired"
        );

        Ok(count)
    }

    /// Buffer one record; nothing reaches disk until `batch_write`
    pub fn batch_insert(&mut self, timestamp_nanos: i64, payload: Vec<u8>) {
        self.pending.push((timestamp_nanos, payload));
    }

    /// Make all buffered records durable
    ///
    /// On failure both files are truncated back to their committed lengths
    /// and the buffer is discarded.
    pub fn batch_write(&mut self) -> StorageResult<u64> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let pending = std::mem::take(&mut self.pending);
        let count = pending.len() as u64;

        let mut data_buf = Vec::with_capacity(pending.iter().map(|(_, p)| p.len()).sum());
        let mut index_buf = Vec::with_capacity(pending.len() * ENTRY_SIZE);
        let mut offset = self.data_len;
        let mut last_timestamp = self.last_timestamp;

        for (timestamp, payload) in &pending {
            let entry = IndexEntry {
                timestamp: *timestamp,
                offset,
                length: payload.len() as u32,
                checksum: crc32fast::hash(payload),
            };
            index_buf.extend_from_slice(&entry.to_bytes());
            data_buf.extend_from_slice(payload);
            offset += payload.len() as u64;
            last_timestamp = Some(*timestamp);
        }

        if let Err(e) = self.write_buffers(&data_buf, &index_buf) {
            tracing::warn!(segment = %self.dir.display(), error = %e, "Segment write failed, rolling back");
            if let Err(rollback) = self.rollback() {
                tracing::error!(segment = %self.dir.display(), error = %rollback, "Segment rollback failed");
            }
            return Err(e);
        }

        self.committed += count;
        self.data_len = offset;
        self.last_timestamp = last_timestamp;

        Ok(count)
    }

    fn write_buffers(&mut self, data_buf: &[u8], index_buf: &[u8]) -> StorageResult<()> {
        self.data.seek(SeekFrom::Start(self.data_len))?;
        self.data.write_all(data_buf)?;
        if self.sync {
            self.data.sync_data()?;
        }

        self.index.seek(SeekFrom::Start(entry_position(self.committed)))?;
        self.index.write_all(index_buf)?;
        if self.sync {
            self.index.sync_data()?;
        }

        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.index.set_len(entry_position(self.committed))?;
        self.data.set_len(self.data_len)?;
        Ok(())
    }

    /// Committed record count
    pub fn len(&self) -> u64 {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// Records buffered but not yet written
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Index timestamp of the last committed record
    pub fn last_timestamp_nanos(&self) -> Option<i64> {
        self.last_timestamp
    }

    pub fn data_size(&self) -> u64 {
        self.data_len
    }
}

/// Read-only snapshot of one segment
///
/// The record count is fixed at open; records committed afterwards are not
/// visible through this reader. A partially written trailing entry is left
/// out rather than reported, since it looks the same as an append in flight.
pub struct SegmentReader {
    dir: PathBuf,
    index: File,
    data: File,
    len: u64,
    data_size: u64,
}

impl SegmentReader {
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let index_path = dir.join(INDEX_FILE);
        let mut index = File::open(&index_path)?;
        let data = File::open(dir.join(DATA_FILE))?;

        // Index length first: every entry it covers had its payload written
        // before it, so the data length read next is never short
        let index_len = index.metadata()?.len();
        let data_size = data.metadata()?.len();
        let len = validate(&mut index, index_len, data_size, &index_path, TornTail::Ignore)?;

        Ok(Self {
            dir,
            index,
            data,
            len,
            data_size,
        })
    }

    fn check_index(&self, index: u64) -> StorageResult<()> {
        if index >= self.len {
            return Err(StorageError::OutOfRange {
                index: index as i64,
                length: self.len,
            });
        }
        Ok(())
    }

    fn timestamp_at(&mut self, index: u64) -> StorageResult<i64> {
        Ok(read_entry(&mut self.index, index)?.timestamp)
    }

    fn decode(&self, index: u64, entry: &IndexEntry, payload: &[u8]) -> StorageResult<Datapoint> {
        if crc32fast::hash(payload) != entry.checksum {
            return Err(StorageError::CorruptSegment(format!(
                "{}: record {} checksum mismatch",
                self.dir.display(),
                index
            )));
        }
        decode_datapoint(payload)
    }
}

impl SegmentRead for SegmentReader {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&mut self, index: u64) -> StorageResult<Datapoint> {
        self.check_index(index)?;
        let entry = read_entry(&mut self.index, index)?;

        let mut payload = vec![0u8; entry.length as usize];
        self.data.seek(SeekFrom::Start(entry.offset))?;
        self.data.read_exact(&mut payload)?;

        self.decode(index, &entry, &payload)
    }

    fn read_batch(&mut self, i1: u64, i2: u64) -> StorageResult<Vec<Datapoint>> {
        self.check_index(i1)?;
        let i2 = i2.min(self.len);
        if i2 <= i1 {
            return Ok(Vec::new());
        }

        let count = (i2 - i1) as usize;
        let mut index_buf = vec![0u8; count * ENTRY_SIZE];
        self.index.seek(SeekFrom::Start(entry_position(i1)))?;
        self.index.read_exact(&mut index_buf)?;
        let entries: Vec<IndexEntry> = index_buf
            .chunks_exact(ENTRY_SIZE)
            .map(IndexEntry::from_bytes)
            .collect();

        // Payloads of consecutive records are contiguous
        let start = entries[0].offset;
        let end = entries[count - 1].end();
        let mut data_buf = vec![0u8; (end - start) as usize];
        self.data.seek(SeekFrom::Start(start))?;
        self.data.read_exact(&mut data_buf)?;

        let mut points = Vec::with_capacity(count);
        for (i, entry) in entries.iter().enumerate() {
            let from = (entry.offset - start) as usize;
            let to = from + entry.length as usize;
            let payload = data_buf.get(from..to).ok_or_else(|| {
                StorageError::CorruptSegment(format!(
                    "{}: record {} outside its batch",
                    self.dir.display(),
                    i1 + i as u64
                ))
            })?;
            points.push(self.decode(i1 + i as u64, entry, payload)?);
        }

        Ok(points)
    }

    fn find_time(&mut self, t: f64) -> StorageResult<TimeSearch> {
        let target = to_nanos(t);
        let (mut lo, mut hi) = (0u64, self.len);

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.timestamp_at(mid)? <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo == self.len {
            Ok(TimeSearch::PastEnd(lo))
        } else {
            Ok(TimeSearch::Found(lo))
        }
    }

    fn last_timestamp(&mut self) -> StorageResult<Option<f64>> {
        if self.len == 0 {
            return Ok(None);
        }
        Ok(Some(self.read(self.len - 1)?.timestamp))
    }

    fn data_size(&self) -> u64 {
        self.data_size
    }
}
