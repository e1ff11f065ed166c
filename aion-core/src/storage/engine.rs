//! Aion - top-level coordinator of the level cascade

use super::{AionConfig, Level, LevelConfig, RepositoryConfig, StoreConfig};
use crate::bucket::{validate_entry, BucketRepository, BucketStore, FileRepository, MemoryBucketBuilder, MemoryRepository};
use crate::filter::AggregationFilter;
use crate::query::{Querier, QueryStream, Store};
use crate::tags::{Tag, TagStore};
use crate::{AionError, Entry, Result, SeriesId, TimeRange};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Time-series engine over an ordered list of levels.
///
/// Entries are only ever put into the first level; every later level is fed
/// by the windows its predecessor closes.
pub struct Aion {
    levels: Vec<Arc<Level>>,
    tags: Option<Arc<dyn TagStore>>,
}

impl Aion {
    /// Wire `(filter, store)` pairs, finest first, into a cascade
    pub fn new(levels: Vec<(AggregationFilter, Arc<dyn Store>)>, tags: Option<Arc<dyn TagStore>>) -> Result<Self> {
        if levels.is_empty() {
            return Err(AionError::Config("at least one level is required".into()));
        }

        let mut next: Option<Arc<Level>> = None;
        let mut wired = Vec::with_capacity(levels.len());
        for (filter, store) in levels.into_iter().rev() {
            let level = Arc::new(Level::new(filter, store, next.take()));
            wired.push(level.clone());
            next = Some(level);
        }
        wired.reverse();

        Ok(Self { levels: wired, tags })
    }

    /// Build every level from configuration; any invalid level fails here
    pub fn from_config(config: &AionConfig) -> Result<Self> {
        if config.levels.is_empty() {
            return Err(AionError::Config("at least one level is required".into()));
        }

        let mut next: Option<Arc<Level>> = None;
        let mut wired = Vec::with_capacity(config.levels.len());
        for (index, level_config) in config.levels.iter().enumerate().rev() {
            let filter = AggregationFilter::new(
                Duration::from_secs(level_config.granularity_secs),
                &level_config.aggregators,
            )?;
            let store = build_store(index, level_config, next.as_ref())?;
            info!(
                "Level {}: granularity {}s, aggregators {:?}, {}s buckets",
                index,
                level_config.granularity_secs,
                level_config.aggregators,
                level_config.store.duration_secs()
            );

            let level = Arc::new(Level::new(filter, store, next.take()));
            wired.push(level.clone());
            next = Some(level);
        }
        wired.reverse();

        Ok(Self { levels: wired, tags: None })
    }

    /// Attach a tag store
    pub fn with_tags(mut self, tags: Arc<dyn TagStore>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Number of levels
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Level by index, finest first
    pub fn level(&self, index: usize) -> Result<&Arc<Level>> {
        self.levels.get(index).ok_or(AionError::LevelNotFound(index))
    }

    /// Insert an entry into the first level, possibly triggering rollups
    pub fn put(&self, series: SeriesId, entry: &Entry) -> Result<()> {
        validate_entry(entry)?;
        self.levels[0].insert(series, entry)
    }

    /// Query one level's store
    pub fn query(
        &self,
        level: usize,
        series: SeriesId,
        range: TimeRange,
        attributes: &[String],
        sink: &mut dyn FnMut(Entry) -> Result<()>,
    ) -> Result<()> {
        self.level(level)?.query(series, range, attributes, sink)
    }

    /// Stream one level's entries to an async consumer
    pub fn query_stream(
        &self,
        level: usize,
        series: SeriesId,
        range: TimeRange,
        attributes: Vec<String>,
    ) -> Result<QueryStream> {
        let querier: Arc<dyn Querier> = self.level(level)?.clone();
        Ok(QueryStream::spawn(
            querier,
            series,
            range,
            attributes,
            crate::config::QUERY_CHANNEL_CAPACITY,
        ))
    }

    /// Push the series' open windows through every level and persist what
    /// each store holds for it
    pub fn flush(&self, series: SeriesId) -> Result<()> {
        self.levels[0].flush(series)
    }

    /// Push every open window through every level and persist every store
    pub fn flush_all(&self) -> Result<()> {
        self.levels[0].flush_all()
    }

    /// Attach tags to a series
    pub fn tag(&self, series: SeriesId, tags: &[Tag]) -> Result<()> {
        self.tag_store()?.tag(series, tags)
    }

    /// Series carrying all of `tags`
    pub fn find(&self, tags: &[Tag]) -> Result<Vec<SeriesId>> {
        self.tag_store()?.find(tags)
    }

    fn tag_store(&self) -> Result<&Arc<dyn TagStore>> {
        self.tags
            .as_ref()
            .ok_or_else(|| AionError::Config("no tag store configured".into()))
    }
}

fn build_store(index: usize, config: &LevelConfig, next: Option<&Arc<Level>>) -> Result<Arc<dyn Store>> {
    match &config.store {
        StoreConfig::Memory {
            duration_secs,
            precision,
            backfill,
        } => {
            let builder = MemoryBucketBuilder::new(Duration::from_secs(*duration_secs), *precision)?;
            if !*backfill {
                return Ok(Arc::new(builder));
            }
            let source: Arc<dyn Querier> = next
                .ok_or_else(|| AionError::Config(format!("level {} backfills but is the last level", index)))?
                .clone();
            Ok(Arc::new(builder.with_source(source)))
        }
        StoreConfig::Bucket {
            duration_secs,
            precision,
            repository,
        } => {
            let repository: Arc<dyn BucketRepository> = match repository {
                RepositoryConfig::Memory => Arc::new(MemoryRepository::new()),
                RepositoryConfig::File { dir, compression } => Arc::new(FileRepository::open(dir, *compression)?),
            };
            Ok(Arc::new(BucketStore::new(
                Duration::from_secs(*duration_secs),
                *precision,
                repository,
            )?))
        }
    }
}
