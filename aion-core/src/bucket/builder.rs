//! In-memory bucket builder (hot tier)

use super::{decode_entries, multiplier, validate_entry, Bucket};
use crate::query::{collect_query, Querier, Store};
use crate::types::{add_duration, truncate};
use crate::{AionError, EncodedAttribute, Entry, Result, SeriesId, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type SeriesBuckets = Arc<Mutex<BTreeMap<Timestamp, Bucket>>>;

/// Per series, an ordered index of open buckets keyed by bucket start.
///
/// With a `source` configured, a query for buckets the builder does not hold
/// first pulls the span from the source and keeps the result hot. An insert
/// creating a bucket seeds it from the source the same way.
pub struct MemoryBucketBuilder {
    duration: Duration,
    multiplier: f64,
    series: RwLock<HashMap<SeriesId, SeriesBuckets>>,
    source: Option<Arc<dyn Querier>>,
}

impl MemoryBucketBuilder {
    /// Create a builder with buckets of `duration` storing `precision` decimals
    pub fn new(duration: Duration, precision: u32) -> Result<Self> {
        if duration < Duration::from_secs(1) {
            return Err(AionError::Config(format!(
                "bucket duration must be at least one second, got {:?}",
                duration
            )));
        }
        Ok(Self {
            duration,
            multiplier: multiplier(precision)?,
            series: RwLock::new(HashMap::new()),
            source: None,
        })
    }

    /// Backfill missing buckets from `source` on query
    pub fn with_source(mut self, source: Arc<dyn Querier>) -> Self {
        self.source = Some(source);
        self
    }

    /// Bucket duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Fixed-point scale factor
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Start of the bucket holding `ts`
    pub fn bucket_start(&self, ts: Timestamp) -> Timestamp {
        truncate(ts, self.duration)
    }

    /// Append an entry to the bucket covering its timestamp
    pub fn insert(&self, series: SeriesId, entry: &Entry) -> Result<()> {
        validate_entry(entry)?;
        let start = self.bucket_start(entry.timestamp);
        let slot = self.slot(series);
        if let Some(source) = &self.source {
            let held = slot.lock().contains_key(&start);
            if !held && self.create_from_source(source.as_ref(), series, &slot, entry)? {
                return Ok(());
            }
        }
        let mut buckets = slot.lock();
        buckets
            .entry(start)
            .or_insert_with(|| Bucket::new(start))
            .write(entry, self.multiplier)
    }

    /// Starts of every bucket but the most recent one
    pub fn buckets_to_write(&self, series: SeriesId) -> Vec<Timestamp> {
        let Some(slot) = self.existing(series) else {
            return Vec::new();
        };
        let buckets = slot.lock();
        let mut starts: Vec<Timestamp> = buckets.keys().copied().collect();
        starts.pop();
        starts
    }

    /// Closed copy of a bucket's streams
    pub fn get(&self, series: SeriesId, start: Timestamp) -> Option<Vec<EncodedAttribute>> {
        let slot = self.existing(series)?;
        let buckets = slot.lock();
        buckets.get(&start).map(Bucket::encoded)
    }

    /// Remove a bucket; returns whether it existed
    pub fn delete(&self, series: SeriesId, start: Timestamp) -> bool {
        let Some(slot) = self.existing(series) else {
            return false;
        };
        let mut buckets = slot.lock();
        buckets.remove(&start).is_some()
    }

    /// Make a persisted bucket hot again; a bucket already held is kept as is
    pub fn load(&self, series: SeriesId, start: Timestamp, encoded: &[EncodedAttribute]) -> Result<()> {
        let bucket = Bucket::from_encoded(start, encoded)?;
        let slot = self.slot(series);
        let mut buckets = slot.lock();
        buckets.entry(start).or_insert(bucket);
        Ok(())
    }

    /// Whether the bucket starting at `start` is held
    pub fn contains(&self, series: SeriesId, start: Timestamp) -> bool {
        self.existing(series)
            .map(|slot| slot.lock().contains_key(&start))
            .unwrap_or(false)
    }

    /// Starts of all held buckets, ascending
    pub fn bucket_starts(&self, series: SeriesId) -> Vec<Timestamp> {
        self.existing(series)
            .map(|slot| slot.lock().keys().copied().collect())
            .unwrap_or_default()
    }

    /// Series with at least one held bucket
    pub fn series(&self) -> Vec<SeriesId> {
        let series = self.series.read();
        let mut ids: Vec<SeriesId> = series
            .iter()
            .filter(|(_, slot)| !slot.lock().is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Create the bucket holding `entry` from the source's entries for its
    /// span plus `entry`, in timestamp order. Returns false when another
    /// writer created the bucket meanwhile.
    fn create_from_source(
        &self,
        source: &dyn Querier,
        series: SeriesId,
        slot: &SeriesBuckets,
        entry: &Entry,
    ) -> Result<bool> {
        let start = self.bucket_start(entry.timestamp);
        let mut entries = collect_query(source, series, self.span(start, start), &[])?;
        let sourced = entries.len();

        let mut buckets = slot.lock();
        if buckets.contains_key(&start) {
            return Ok(false);
        }
        entries.push(entry.clone());
        entries.sort_by_key(|e| e.timestamp);
        let mut bucket = Bucket::new(start);
        for e in &entries {
            bucket.write(e, self.multiplier)?;
        }
        buckets.insert(start, bucket);
        if sourced > 0 {
            debug!("Seeded bucket {} of series {} with {} source entries", start, series, sourced);
        }
        Ok(true)
    }

    /// Every instant of the buckets starting at `first` through `last`
    fn span(&self, first: Timestamp, last: Timestamp) -> TimeRange {
        TimeRange::new(first, add_duration(last, self.duration) - chrono::Duration::nanoseconds(1))
    }

    /// Pull the buckets of `range` the builder does not hold from the source.
    ///
    /// Only buckets for which the source returned entries are created, and a
    /// bucket that became hot meanwhile is left untouched, so repeating the
    /// same query never duplicates entries.
    fn backfill(&self, source: &dyn Querier, series: SeriesId, range: &TimeRange) -> Result<()> {
        let first = self.bucket_start(range.start);
        let last = self.bucket_start(range.end);
        let span = self.span(first, last);

        // Fully hot spans skip the source
        if let Some(slot) = self.existing(series) {
            let buckets = slot.lock();
            let mut start = first;
            let mut missing = false;
            while start <= last {
                if !buckets.contains_key(&start) {
                    missing = true;
                    break;
                }
                start = add_duration(start, self.duration);
            }
            if !missing {
                return Ok(());
            }
        }

        let entries = collect_query(source, series, span, &[])?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut grouped: BTreeMap<Timestamp, Vec<Entry>> = BTreeMap::new();
        for entry in entries {
            grouped.entry(self.bucket_start(entry.timestamp)).or_default().push(entry);
        }

        let slot = self.slot(series);
        let mut buckets = slot.lock();
        let mut created = 0;
        for (start, entries) in grouped {
            if buckets.contains_key(&start) {
                continue;
            }
            let mut bucket = Bucket::new(start);
            for entry in &entries {
                bucket.write(entry, self.multiplier)?;
            }
            buckets.insert(start, bucket);
            created += 1;
        }
        if created > 0 {
            debug!("Backfilled {} buckets of series {} from source", created, series);
        }
        Ok(())
    }

    fn existing(&self, series: SeriesId) -> Option<SeriesBuckets> {
        self.series.read().get(&series).cloned()
    }

    fn slot(&self, series: SeriesId) -> SeriesBuckets {
        if let Some(slot) = self.series.read().get(&series) {
            return slot.clone();
        }
        self.series
            .write()
            .entry(series)
            .or_insert_with(|| Arc::new(Mutex::new(BTreeMap::new())))
            .clone()
    }
}

impl Querier for MemoryBucketBuilder {
    fn query(
        &self,
        series: SeriesId,
        range: TimeRange,
        attributes: &[String],
        sink: &mut dyn FnMut(Entry) -> Result<()>,
    ) -> Result<()> {
        let range = range.to_second_resolution();
        if range.start > range.end {
            return Ok(());
        }
        if let Some(source) = &self.source {
            self.backfill(source.as_ref(), series, &range)?;
        }

        // Snapshot under the lock, decode outside it
        let snapshot: Vec<(Timestamp, Vec<EncodedAttribute>)> = match self.existing(series) {
            Some(slot) => {
                let buckets = slot.lock();
                buckets
                    .range(self.bucket_start(range.start)..=range.end)
                    .map(|(start, bucket)| (*start, bucket.encoded()))
                    .collect()
            }
            None => return Ok(()),
        };

        for (start, encoded) in snapshot {
            decode_entries(start, &encoded, &range, attributes, self.multiplier, sink)?;
        }
        Ok(())
    }
}

impl Store for MemoryBucketBuilder {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<()> {
        MemoryBucketBuilder::insert(self, series, entry)
    }
}
