//! Cold tier repository interface and the in-memory implementation

use super::decode_entries;
use crate::types::{from_unix_seconds, partition_key, truncate, TIME_ATTRIBUTE};
use crate::{BucketKey, EncodedAttribute, Entry, Result, SeriesId, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Durable storage of closed buckets, addressed by [`BucketKey`]
pub trait BucketRepository: Send + Sync {
    /// Store every stream of a bucket, replacing what was stored before
    fn put(&self, key: &BucketKey, attributes: &[EncodedAttribute]) -> Result<()>;

    /// Load the named streams of a bucket (all streams for an empty list);
    /// `None` if the bucket was never stored
    fn get(&self, key: &BucketKey, attributes: &[String]) -> Result<Option<Vec<EncodedAttribute>>>;

    /// Starts of the stored buckets of `series` whose start lies in
    /// `[truncate(range.start), range.end]`, ascending
    fn starts(&self, series: SeriesId, duration: Duration, range: &TimeRange) -> Result<Vec<Timestamp>>;

    /// Decode the stored entries of `series` within `range`
    fn query(
        &self,
        series: SeriesId,
        duration: Duration,
        multiplier: f64,
        range: &TimeRange,
        attributes: &[String],
        sink: &mut dyn FnMut(Entry) -> Result<()>,
    ) -> Result<()> {
        let range = range.to_second_resolution();
        let names = with_time_stream(attributes);
        for start in self.starts(series, duration, &range)? {
            let key = BucketKey::new(series, duration, start);
            if let Some(encoded) = self.get(&key, &names)? {
                decode_entries(start, &encoded, &range, attributes, multiplier, sink)?;
            }
        }
        Ok(())
    }
}

/// Attribute selection for a repository read that must be decodable
pub(crate) fn with_time_stream(attributes: &[String]) -> Vec<String> {
    if attributes.is_empty() {
        return Vec::new();
    }
    let mut names = Vec::with_capacity(attributes.len() + 1);
    names.push(TIME_ATTRIBUTE.to_string());
    names.extend(attributes.iter().filter(|a| *a != TIME_ATTRIBUTE).cloned());
    names
}

/// Keep only the selected streams; an empty selection keeps all
pub(crate) fn select(encoded: Vec<EncodedAttribute>, attributes: &[String]) -> Vec<EncodedAttribute> {
    if attributes.is_empty() {
        return encoded;
    }
    encoded
        .into_iter()
        .filter(|a| attributes.iter().any(|n| *n == a.name))
        .collect()
}

/// Lower bound of the bucket starts a range can touch
pub(crate) fn first_start(range: &TimeRange, duration: Duration) -> Timestamp {
    truncate(range.start, duration)
}

/// Repository keeping buckets in process memory, keyed like a wide-column
/// table: partition key to (sort key to streams)
#[derive(Default)]
pub struct MemoryRepository {
    partitions: RwLock<HashMap<String, BTreeMap<i64, Vec<EncodedAttribute>>>>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored buckets
    pub fn len(&self) -> usize {
        self.partitions.read().values().map(BTreeMap::len).sum()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BucketRepository for MemoryRepository {
    fn put(&self, key: &BucketKey, attributes: &[EncodedAttribute]) -> Result<()> {
        let mut partitions = self.partitions.write();
        partitions
            .entry(key.partition_key())
            .or_default()
            .insert(key.sort_key(), attributes.to_vec());
        Ok(())
    }

    fn get(&self, key: &BucketKey, attributes: &[String]) -> Result<Option<Vec<EncodedAttribute>>> {
        let partitions = self.partitions.read();
        let stored = partitions
            .get(&key.partition_key())
            .and_then(|p| p.get(&key.sort_key()))
            .cloned();
        Ok(stored.map(|encoded| select(encoded, attributes)))
    }

    fn starts(&self, series: SeriesId, duration: Duration, range: &TimeRange) -> Result<Vec<Timestamp>> {
        let first = first_start(range, duration).timestamp();
        let last = range.end.timestamp();
        if first > last {
            return Ok(Vec::new());
        }
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(&partition_key(series, duration)) else {
            return Ok(Vec::new());
        };
        partition
            .range(first..=last)
            .map(|(secs, _)| from_unix_seconds(*secs))
            .collect()
    }
}
