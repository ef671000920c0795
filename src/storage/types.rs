//! Core data types for the timebatch storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Datapoint`: A single timestamped value
//! - `StreamKey`: Identity of a (sub)stream
//! - `Batch`: An ordered run of pending datapoints for one stream
//! - `TimeSearch` / `IndexSpan`: Results of time-to-index resolution

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single timestamped value
///
/// Timestamps are seconds since the Unix epoch. Storage order, not timestamp,
/// is authoritative; ties are allowed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Datapoint {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// The stored value
    pub data: serde_json::Value,
    /// Who inserted the point, if it differs from the owning device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Datapoint {
    /// Create a datapoint at a specific timestamp
    pub fn new(timestamp: f64, data: serde_json::Value) -> Self {
        Self {
            timestamp,
            data,
            sender: None,
        }
    }

    /// Create a datapoint stamped with the current time
    pub fn now(data: serde_json::Value) -> Self {
        let now = Utc::now();
        let timestamp = now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9;
        Self::new(timestamp, data)
    }

    /// Builder method: set the sender
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Timestamp as integer nanoseconds, the resolution of the segment index
    pub fn timestamp_nanos(&self) -> i64 {
        to_nanos(self.timestamp)
    }
}

/// Convert seconds to integer nanoseconds
pub fn to_nanos(seconds: f64) -> i64 {
    (seconds * 1e9).round() as i64
}

/// Ordering check over an in-memory run of datapoints
pub trait DatapointSlice {
    /// True when timestamps never decrease
    fn is_timestamp_ordered(&self) -> bool;
}

impl DatapointSlice for [Datapoint] {
    fn is_timestamp_ordered(&self) -> bool {
        self.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
    }
}

/// Identity of a stream or substream
///
/// The primary substream is the empty string. Substreams share quota
/// accounting with their parent stream but hold disjoint data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub device: i64,
    pub stream: i64,
    #[serde(default)]
    pub substream: String,
}

impl StreamKey {
    /// Key of a primary substream
    pub fn new(device: i64, stream: i64) -> Self {
        Self {
            device,
            stream,
            substream: String::new(),
        }
    }

    /// Key of a named substream
    pub fn substream(device: i64, stream: i64, substream: impl Into<String>) -> Self {
        Self {
            device,
            stream,
            substream: substream.into(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.substream.is_empty()
    }

    /// Whether this key belongs to `(device, stream)`
    pub fn in_stream(&self, device: i64, stream: i64) -> bool {
        self.device == device && self.stream == stream
    }

    /// Relative directory holding this substream's segment
    ///
    /// Substream names are hex-encoded so any string maps to a safe file name;
    /// the `_` prefix keeps them disjoint from the primary directory.
    pub fn relative_dir(&self) -> PathBuf {
        let sub = if self.is_primary() {
            "main".to_string()
        } else {
            let hex: String = self
                .substream
                .bytes()
                .map(|b| format!("{:02x}", b))
                .collect();
            format!("_{}", hex)
        };
        PathBuf::from(self.device.to_string())
            .join(self.stream.to_string())
            .join(sub)
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_primary() {
            write!(f, "{}/{}", self.device, self.stream)
        } else {
            write!(f, "{}/{}/{}", self.device, self.stream, self.substream)
        }
    }
}

/// An ordered run of one stream's pending datapoints
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub key: StreamKey,
    /// Absolute index of the first datapoint
    pub start_index: u64,
    pub data: Vec<Datapoint>,
}

impl Batch {
    pub fn new(key: StreamKey, start_index: u64, data: Vec<Datapoint>) -> Self {
        Self {
            key,
            start_index,
            data,
        }
    }

    /// Absolute index one past the last datapoint
    pub fn end_index(&self) -> u64 {
        self.start_index + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Outcome of resolving a timestamp to an index
///
/// Both variants carry a meaningful index; `PastEnd` signals that the
/// timestamp is at or beyond the last stored datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSearch {
    Found(u64),
    PastEnd(u64),
}

impl TimeSearch {
    pub fn index(&self) -> u64 {
        match self {
            TimeSearch::Found(i) | TimeSearch::PastEnd(i) => *i,
        }
    }

    pub fn is_past_end(&self) -> bool {
        matches!(self, TimeSearch::PastEnd(_))
    }
}

/// Upper bound of an [`IndexSpan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanEnd {
    /// Exclusive end index
    Bounded(u64),
    /// The span runs to the end of the stored data
    OpenTail,
}

/// Index range resolved from a time range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpan {
    pub start: u64,
    pub end: SpanEnd,
}
