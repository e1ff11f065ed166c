//! Hot + cold bucket store

use super::repository::{with_time_stream, BucketRepository};
use super::{decode_entries, MemoryBucketBuilder};
use crate::query::{Querier, Store};
use crate::{BucketKey, Entry, Result, SeriesId, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type Gate = Arc<RwLock<()>>;

/// A builder for the open buckets in front of a repository for closed ones.
///
/// Inserts write through to the builder and then move every bucket but the
/// newest into the repository. Queries read the builder first and then the
/// repository, skipping bucket starts the builder holds. Per series, flushes
/// and queries are serialized, so a bucket is never seen in both tiers.
pub struct BucketStore {
    builder: MemoryBucketBuilder,
    repository: Arc<dyn BucketRepository>,
    gates: RwLock<HashMap<SeriesId, Gate>>,
}

impl BucketStore {
    /// Create a store over `repository`
    pub fn new(duration: Duration, precision: u32, repository: Arc<dyn BucketRepository>) -> Result<Self> {
        Ok(Self {
            builder: MemoryBucketBuilder::new(duration, precision)?,
            repository,
            gates: RwLock::new(HashMap::new()),
        })
    }

    /// Bucket duration
    pub fn duration(&self) -> Duration {
        self.builder.duration()
    }

    /// Hot tier
    pub fn builder(&self) -> &MemoryBucketBuilder {
        &self.builder
    }

    /// Cold tier
    pub fn repository(&self) -> &Arc<dyn BucketRepository> {
        &self.repository
    }

    /// Write every hot bucket of `series` to the repository, including the
    /// newest one. The newest bucket stays hot so later entries extend it.
    fn persist_series(&self, series: SeriesId) -> Result<()> {
        let gate = self.gate(series);
        let _guard = gate.write();
        self.flush_closed(series)?;
        if let Some(start) = self.builder.bucket_starts(series).last().copied() {
            if let Some(encoded) = self.builder.get(series, start) {
                if !encoded.is_empty() {
                    self.repository.put(&self.key(series, start), &encoded)?;
                }
            }
        }
        Ok(())
    }

    fn key(&self, series: SeriesId, start: Timestamp) -> BucketKey {
        BucketKey::new(series, self.builder.duration(), start)
    }

    /// Bring a persisted bucket back into the builder before extending it
    fn rehydrate(&self, series: SeriesId, start: Timestamp) -> Result<()> {
        if self.builder.contains(series, start) {
            return Ok(());
        }
        if let Some(encoded) = self.repository.get(&self.key(series, start), &[])? {
            self.builder.load(series, start, &encoded)?;
            debug!("Rehydrated bucket {}", self.key(series, start));
        }
        Ok(())
    }

    /// Move closed buckets to the repository; a failed put leaves the
    /// bucket hot for the next insert to retry
    fn flush_closed(&self, series: SeriesId) -> Result<()> {
        for start in self.builder.buckets_to_write(series) {
            let Some(encoded) = self.builder.get(series, start) else {
                continue;
            };
            if encoded.is_empty() {
                self.builder.delete(series, start);
                continue;
            }

            let key = self.key(series, start);
            match self.repository.put(&key, &encoded) {
                Ok(()) => {
                    self.builder.delete(series, start);
                    debug!("Flushed bucket {} to repository", key);
                }
                Err(e) => {
                    warn!("Failed to flush bucket {}, keeping it in memory: {}", key, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn gate(&self, series: SeriesId) -> Gate {
        if let Some(gate) = self.gates.read().get(&series) {
            return gate.clone();
        }
        self.gates
            .write()
            .entry(series)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

impl Querier for BucketStore {
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
        let gate = self.gate(series);
        let _guard = gate.read();

        let hot: BTreeSet<Timestamp> = self.builder.bucket_starts(series).into_iter().collect();
        self.builder.query(series, range, attributes, sink)?;

        let duration = self.builder.duration();
        let names = with_time_stream(attributes);
        for start in self.repository.starts(series, duration, &range)? {
            if hot.contains(&start) {
                continue;
            }
            if let Some(encoded) = self.repository.get(&self.key(series, start), &names)? {
                decode_entries(start, &encoded, &range, attributes, self.builder.multiplier(), sink)?;
            }
        }
        Ok(())
    }
}

impl Store for BucketStore {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<()> {
        let gate = self.gate(series);
        let _guard = gate.write();

        self.rehydrate(series, self.builder.bucket_start(entry.timestamp))?;
        self.builder.insert(series, entry)?;
        self.flush_closed(series)
    }

    fn persist(&self, series: SeriesId) -> Result<()> {
        self.persist_series(series)
    }

    fn persist_all(&self) -> Result<()> {
        for series in self.builder.series() {
            self.persist_series(series)?;
        }
        debug!("Persisted open buckets to repository");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryRepository;
    use crate::query::collect_query;
    use crate::{AionError, EncodedAttribute};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    const T0: i64 = 1_400_000_040;
    const MINUTE: Duration = Duration::from_secs(60);

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store() -> (BucketStore, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        (BucketStore::new(MINUTE, 1, repo.clone()).unwrap(), repo)
    }

    fn all(store: &BucketStore, series: SeriesId, from: i64, to: i64) -> Vec<Entry> {
        collect_query(store, series, TimeRange::new(at(from), at(to)), &[]).unwrap()
    }

    #[test]
    fn test_closed_buckets_move_to_repository() {
        let (store, repo) = store();
        let series = Uuid::new_v4();
        for i in 0..3 {
            store
                .insert(series, &Entry::single(at(T0 + i * 60), "raw", i as f64))
                .unwrap();
        }
        assert_eq!(repo.len(), 2);
        assert_eq!(store.builder().bucket_starts(series), vec![at(T0 + 120)]);
    }

    #[test]
    fn test_tier_transparency() {
        let (store, repo) = store();
        let reference = MemoryBucketBuilder::new(MINUTE, 1).unwrap();
        let series = Uuid::new_v4();

        let mut before = Vec::new();
        for i in 0..200 {
            let e = Entry::single(at(T0 + i * 2), "raw", (i % 17) as f64 / 10.0);
            reference.insert(series, &e).unwrap();
            store.insert(series, &e).unwrap();
            if i == 20 {
                before = all(&store, series, T0, T0 + 40);
            }
        }
        assert!(repo.len() > 0);

        let hot_only = collect_query(&reference, series, TimeRange::new(at(T0), at(T0 + 400)), &[]).unwrap();
        let mut mixed = all(&store, series, T0, T0 + 400);
        mixed.sort_by_key(|e| e.timestamp);
        assert_eq!(mixed, hot_only);
        assert_eq!(mixed.len(), 200);
        assert_eq!(all(&store, series, T0, T0 + 40), before);
    }

    #[test]
    fn test_late_entry_extends_persisted_bucket() {
        let (store, repo) = store();
        let series = Uuid::new_v4();
        store.insert(series, &Entry::single(at(T0), "raw", 1.0)).unwrap();
        store.insert(series, &Entry::single(at(T0 + 60), "raw", 2.0)).unwrap();
        assert_eq!(repo.len(), 1);

        // Late entry for the already persisted first bucket
        store.insert(series, &Entry::single(at(T0 + 30), "raw", 1.5)).unwrap();

        let values: Vec<f64> = all(&store, series, T0, T0 + 59)
            .iter()
            .map(|e| e.get("raw").unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 1.5]);
    }

    #[test]
    fn test_cold_range_end_on_bucket_boundary_is_inclusive() {
        let (store, repo) = store();
        let series = Uuid::new_v4();
        for offset in [30, 60, 120] {
            store.insert(series, &Entry::single(at(T0 + offset), "raw", offset as f64)).unwrap();
        }
        assert_eq!(repo.len(), 2);

        let entries = all(&store, series, T0, T0 + 60);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], Entry::single(at(T0 + 60), "raw", 60.0));
    }

    /// Repository whose puts can be switched off
    struct Flaky {
        inner: MemoryRepository,
        down: AtomicBool,
    }

    impl BucketRepository for Flaky {
        fn put(&self, key: &BucketKey, attributes: &[EncodedAttribute]) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AionError::Repository("write timeout".into()));
            }
            self.inner.put(key, attributes)
        }

        fn get(&self, key: &BucketKey, attributes: &[String]) -> Result<Option<Vec<EncodedAttribute>>> {
            self.inner.get(key, attributes)
        }

        fn starts(&self, series: SeriesId, duration: Duration, range: &TimeRange) -> Result<Vec<Timestamp>> {
            self.inner.starts(series, duration, range)
        }
    }

    #[test]
    fn test_failed_put_keeps_bucket_hot() {
        let repo = Arc::new(Flaky {
            inner: MemoryRepository::new(),
            down: AtomicBool::new(true),
        });
        let store = BucketStore::new(MINUTE, 1, repo.clone()).unwrap();
        let series = Uuid::new_v4();

        store.insert(series, &Entry::single(at(T0), "raw", 1.0)).unwrap();
        let err = store
            .insert(series, &Entry::single(at(T0 + 60), "raw", 2.0))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.builder().contains(series, at(T0)));
        assert_eq!(all(&store, series, T0, T0 + 119).len(), 2);

        repo.down.store(false, Ordering::SeqCst);
        store.insert(series, &Entry::single(at(T0 + 61), "raw", 3.0)).unwrap();
        assert!(!store.builder().contains(series, at(T0)));
        assert_eq!(repo.inner.len(), 1);
        assert_eq!(all(&store, series, T0, T0 + 119).len(), 3);
    }

    #[test]
    fn test_persist_writes_open_bucket() {
        let (store, repo) = store();
        let series = Uuid::new_v4();
        store.insert(series, &Entry::single(at(T0), "raw", 1.0)).unwrap();
        store.persist(series).unwrap();
        assert_eq!(repo.len(), 1);

        // Still hot: the query must not return it twice
        assert_eq!(all(&store, series, T0, T0 + 59).len(), 1);
        store.insert(series, &Entry::single(at(T0 + 1), "raw", 2.0)).unwrap();
        assert_eq!(all(&store, series, T0, T0 + 59).len(), 2);
    }
}
