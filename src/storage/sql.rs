//! SQLite segment backend
//!
//! Keeps every committed record in one `datapoints` table keyed by
//! `(device, stream, substream, idx)`. Useful where many small streams would
//! otherwise mean many small files.

use crate::storage::codec::{decode_datapoint, encode_datapoint, CompressionType};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::{watermark_skip, SegmentRead, SegmentStore};
use crate::storage::types::{to_nanos, Datapoint, StreamKey, TimeSearch};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS streams (
        device INTEGER NOT NULL,
        stream INTEGER NOT NULL,
        substream TEXT NOT NULL,
        PRIMARY KEY (device, stream, substream)
    );
    CREATE TABLE IF NOT EXISTS datapoints (
        device INTEGER NOT NULL,
        stream INTEGER NOT NULL,
        substream TEXT NOT NULL,
        idx INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (device, stream, substream, idx)
    );
    CREATE INDEX IF NOT EXISTS idx_datapoints_time
        ON datapoints(device, stream, substream, timestamp);
";

/// Segment store backed by a single SQLite database
pub struct SqliteSegmentStore {
    conn: Arc<Mutex<Connection>>,
    compression: CompressionType,
}

impl SqliteSegmentStore {
    /// Create or open `<data_dir>/segments.db`
    pub fn open(data_dir: impl AsRef<Path>, compression: CompressionType) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("segments.db");

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        tracing::info!(path = %path.display(), "Opened SQLite segment store");
        Self::with_connection(conn, compression)
    }

    /// In-memory database, for tests and throwaway instances
    pub fn open_in_memory(compression: CompressionType) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, compression)
    }

    fn with_connection(conn: Connection, compression: CompressionType) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            compression,
        })
    }

    fn count(conn: &Connection, key: &StreamKey) -> StorageResult<u64> {
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM datapoints
             WHERE device = ?1 AND stream = ?2 AND substream = ?3",
            params![key.device, key.stream, key.substream],
            |row| row.get(0),
        )?;
        Ok(next as u64)
    }
}

impl SegmentStore for SqliteSegmentStore {
    fn create(&self, key: &StreamKey) -> StorageResult<()> {
        self.conn.lock()?.execute(
            "INSERT OR IGNORE INTO streams (device, stream, substream) VALUES (?1, ?2, ?3)",
            params![key.device, key.stream, key.substream],
        )?;
        Ok(())
    }

    fn length(&self, key: &StreamKey) -> StorageResult<u64> {
        let conn = self.conn.lock()?;
        Self::count(&conn, key)
    }

    fn append(
        &self,
        key: &StreamKey,
        start_index: u64,
        points: &[Datapoint],
    ) -> StorageResult<u64> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        let committed = Self::count(&tx, key)?;
        let skip = watermark_skip(key, committed, start_index, points.len())?;
        if skip == points.len() {
            return Ok(0);
        }

        tx.execute(
            "INSERT OR IGNORE INTO streams (device, stream, substream) VALUES (?1, ?2, ?3)",
            params![key.device, key.stream, key.substream],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO datapoints (device, stream, substream, idx, timestamp, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for (i, dp) in points.iter().enumerate().skip(skip) {
                let payload = encode_datapoint(dp, self.compression)?;
                let idx = (start_index + i as u64) as i64;
                stmt.execute(params![
                    key.device,
                    key.stream,
                    key.substream,
                    idx,
                    dp.timestamp_nanos(),
                    payload
                ])?;
            }
        }

        tx.commit()?;

        let written = (points.len() - skip) as u64;
        tracing::debug!(stream = %key, written, "Appended to SQL segment");
        Ok(written)
    }

    fn reader(&self, key: &StreamKey) -> StorageResult<Box<dyn SegmentRead>> {
        let (len, data_size) = {
            let conn = self.conn.lock()?;
            let len = Self::count(&conn, key)?;
            let data_size: i64 = conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM datapoints
                 WHERE device = ?1 AND stream = ?2 AND substream = ?3",
                params![key.device, key.stream, key.substream],
                |row| row.get(0),
            )?;
            (len, data_size as u64)
        };

        Ok(Box::new(SqliteSegmentReader {
            conn: Arc::clone(&self.conn),
            key: key.clone(),
            len,
            data_size,
        }))
    }

    fn delete_substream(&self, key: &StreamKey) -> StorageResult<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM datapoints WHERE device = ?1 AND stream = ?2 AND substream = ?3",
            params![key.device, key.stream, key.substream],
        )?;
        tx.execute(
            "DELETE FROM streams WHERE device = ?1 AND stream = ?2 AND substream = ?3",
            params![key.device, key.stream, key.substream],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_stream(&self, device: i64, stream: i64) -> StorageResult<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM datapoints WHERE device = ?1 AND stream = ?2",
            params![device, stream],
        )?;
        tx.execute(
            "DELETE FROM streams WHERE device = ?1 AND stream = ?2",
            params![device, stream],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_device(&self, device: i64) -> StorageResult<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM datapoints WHERE device = ?1", params![device])?;
        tx.execute("DELETE FROM streams WHERE device = ?1", params![device])?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        self.conn
            .lock()?
            .execute_batch("DELETE FROM datapoints; DELETE FROM streams;")?;
        Ok(())
    }
}

/// Snapshot reader over one stream's rows
///
/// Rows with `idx >= len` are ignored, so concurrent appends stay invisible.
pub struct SqliteSegmentReader {
    conn: Arc<Mutex<Connection>>,
    key: StreamKey,
    len: u64,
    data_size: u64,
}

impl SqliteSegmentReader {
    fn out_of_range(&self, index: u64) -> StorageError {
        StorageError::OutOfRange {
            index: index as i64,
            length: self.len,
        }
    }
}

impl SegmentRead for SqliteSegmentReader {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&mut self, index: u64) -> StorageResult<Datapoint> {
        if index >= self.len {
            return Err(self.out_of_range(index));
        }

        let payload: Option<Vec<u8>> = self
            .conn
            .lock()?
            .query_row(
                "SELECT data FROM datapoints
                 WHERE device = ?1 AND stream = ?2 AND substream = ?3 AND idx = ?4",
                params![self.key.device, self.key.stream, self.key.substream, index as i64],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(payload) => decode_datapoint(&payload),
            None => Err(StorageError::CorruptSegment(format!(
                "{}: record {} missing",
                self.key, index
            ))),
        }
    }

    fn read_batch(&mut self, i1: u64, i2: u64) -> StorageResult<Vec<Datapoint>> {
        if i1 >= self.len {
            return Err(self.out_of_range(i1));
        }
        let i2 = i2.min(self.len);
        if i2 <= i1 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT data FROM datapoints
             WHERE device = ?1 AND stream = ?2 AND substream = ?3 AND idx >= ?4 AND idx < ?5
             ORDER BY idx",
        )?;
        let rows = stmt.query_map(
            params![
                self.key.device,
                self.key.stream,
                self.key.substream,
                i1 as i64,
                i2 as i64
            ],
            |row| row.get::<_, Vec<u8>>(0),
        )?;

        let mut points = Vec::with_capacity((i2 - i1) as usize);
        for payload in rows {
            points.push(decode_datapoint(&payload?)?);
        }

        if points.len() as u64 != i2 - i1 {
            return Err(StorageError::CorruptSegment(format!(
                "{}: expected {} records in [{}, {}), found {}",
                self.key,
                i2 - i1,
                i1,
                i2,
                points.len()
            )));
        }

        Ok(points)
    }

    fn find_time(&mut self, t: f64) -> StorageResult<TimeSearch> {
        // Timestamps are non-decreasing, so the count of records at or before t
        // is the first index strictly after it
        let index: i64 = self.conn.lock()?.query_row(
            "SELECT COUNT(*) FROM datapoints
             WHERE device = ?1 AND stream = ?2 AND substream = ?3 AND idx < ?4 AND timestamp <= ?5",
            params![
                self.key.device,
                self.key.stream,
                self.key.substream,
                self.len as i64,
                to_nanos(t)
            ],
            |row| row.get(0),
        )?;

        let index = index as u64;
        if index >= self.len {
            Ok(TimeSearch::PastEnd(self.len))
        } else {
            Ok(TimeSearch::Found(index))
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
