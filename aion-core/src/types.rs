//! Core types for Aion

use crate::{AionError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Series identifier, assigned once when a series is created
pub type SeriesId = Uuid;

/// Instant type used throughout the engine
pub type Timestamp = DateTime<Utc>;

/// Reserved attribute name of the per-bucket time stream
pub const TIME_ATTRIBUTE: &str = "times";

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// One timestamped set of named float attributes for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Instant of the sample
    pub timestamp: Timestamp,
    /// Attribute values; the set may differ between entries of a series
    pub attributes: BTreeMap<String, f64>,
}

impl Entry {
    /// Create an entry without attributes
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    /// Create an entry with a single attribute
    pub fn single(timestamp: Timestamp, name: impl Into<String>, value: f64) -> Self {
        Self::new(timestamp).with_attribute(name, value)
    }

    /// Add an attribute to the entry
    pub fn with_attribute(mut self, name: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Get an attribute value
    pub fn get(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).copied()
    }

    /// Timestamp in whole Unix seconds
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

/// Inclusive time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start instant (inclusive)
    pub start: Timestamp,
    /// End instant (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Same range with the start truncated to whole seconds
    pub fn to_second_resolution(&self) -> Self {
        Self {
            start: truncate(self.start, Duration::from_secs(1)),
            end: self.end,
        }
    }
}

/// One encoded stream of a bucket, e.g. the "avg" values or the time stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedAttribute {
    /// Attribute name
    pub name: String,
    /// Closed code stream
    pub data: Vec<u8>,
}

impl EncodedAttribute {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Address of a persisted bucket: (series, tier duration, bucket start)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub series: SeriesId,
    pub duration: Duration,
    pub start: Timestamp,
}

impl BucketKey {
    /// Create a new bucket key
    pub fn new(series: SeriesId, duration: Duration, start: Timestamp) -> Self {
        Self {
            series,
            duration,
            start,
        }
    }

    /// Tier duration in whole seconds
    pub fn duration_secs(&self) -> u64 {
        self.duration.as_secs()
    }

    /// Hash/partition key: `<series-uuid>|<tierDurationSeconds>`
    pub fn partition_key(&self) -> String {
        partition_key(self.series, self.duration)
    }

    /// Range/sort key: bucket start in Unix seconds
    pub fn sort_key(&self) -> i64 {
        self.start.timestamp()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition_key(), self.sort_key())
    }
}

/// Partition key for a series at a tier duration
pub fn partition_key(series: SeriesId, duration: Duration) -> String {
    format!("{}|{}", series, duration.as_secs())
}

/// Truncate an instant down to a multiple of `granularity` since the Unix epoch.
///
/// A zero granularity returns the instant unchanged.
pub fn truncate(ts: Timestamp, granularity: Duration) -> Timestamp {
    let step = granularity.as_nanos() as i128;
    if step == 0 {
        return ts;
    }
    let nanos = ts.timestamp() as i128 * NANOS_PER_SEC + ts.timestamp_subsec_nanos() as i128;
    let truncated = nanos - nanos.rem_euclid(step);
    let secs = truncated.div_euclid(NANOS_PER_SEC) as i64;
    let subsec = truncated.rem_euclid(NANOS_PER_SEC) as u32;
    Utc.timestamp_opt(secs, subsec).single().unwrap_or(ts)
}

/// Shift an instant forward by a std duration, saturating at the representable maximum
pub fn add_duration(ts: Timestamp, d: Duration) -> Timestamp {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| ts.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Instant from whole Unix seconds
pub fn from_unix_seconds(secs: i64) -> Result<Timestamp> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AionError::Corruption(format!("timestamp out of range: {}", secs)))
}
