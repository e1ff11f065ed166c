//! Series metadata tags
//!
//! Tags resolve a query such as `destination=example.com` into the series
//! identifiers the per-series query path then reads. A series may carry
//! several values for the same tag name.

use crate::{AionError, Result, SeriesId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// One name/value label attached to a series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    /// Create a new tag
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Tag index over series
pub trait TagStore: Send + Sync {
    /// Attach `tags` to `series`; tagging is additive
    fn tag(&self, series: SeriesId, tags: &[Tag]) -> Result<()>;

    /// Series carrying every one of `tags`, ascending. An empty list matches
    /// every tagged series.
    fn find(&self, tags: &[Tag]) -> Result<Vec<SeriesId>>;
}

/// In-process inverted index from tag to series
#[derive(Default)]
pub struct MemoryTagStore {
    index: RwLock<HashMap<Tag, BTreeSet<SeriesId>>>,
}

impl MemoryTagStore {
    /// Create an empty tag store
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags attached to `series`, sorted
    pub fn tags_of(&self, series: SeriesId) -> Vec<Tag> {
        let index = self.index.read();
        let mut tags: Vec<Tag> = index
            .iter()
            .filter(|(_, members)| members.contains(&series))
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }
}

impl TagStore for MemoryTagStore {
    fn tag(&self, series: SeriesId, tags: &[Tag]) -> Result<()> {
        if let Some(tag) = tags.iter().find(|t| t.name.is_empty()) {
            return Err(AionError::InvalidEntry(format!("tag with empty name: {}", tag)));
        }
        let mut index = self.index.write();
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(series);
        }
        Ok(())
    }

    fn find(&self, tags: &[Tag]) -> Result<Vec<SeriesId>> {
        let index = self.index.read();
        if tags.is_empty() {
            let all: BTreeSet<SeriesId> = index.values().flatten().copied().collect();
            return Ok(all.into_iter().collect());
        }

        let mut sets = Vec::with_capacity(tags.len());
        for tag in tags {
            match index.get(tag) {
                Some(members) => sets.push(members),
                None => return Ok(Vec::new()),
            }
        }
        // Intersect starting from the smallest set
        sets.sort_by_key(|s| s.len());
        let (smallest, rest) = sets.split_at(1);
        Ok(smallest[0]
            .iter()
            .filter(|id| rest.iter().all(|s| s.contains(*id)))
            .copied()
            .collect())
    }
}
