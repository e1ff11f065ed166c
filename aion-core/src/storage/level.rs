//! One tier of the hierarchy

use crate::filter::AggregationFilter;
use crate::query::{Querier, Store};
use crate::{Entry, Result, SeriesId, TimeRange};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

type SeriesGate = Arc<Mutex<()>>;

/// A filter paired with a store, linked to the next coarser level.
///
/// Windows closed by the filter are written to this level's store and, once
/// that succeeded, offered to the next level. A failure stops the cascade at
/// the failing level; levels before it keep what they already stored.
///
/// Per series, filtering and forwarding happen under one lock, so closed
/// windows reach the store and the next level in the order they closed.
pub struct Level {
    filter: AggregationFilter,
    store: Arc<dyn Store>,
    next: Option<Arc<Level>>,
    gates: RwLock<HashMap<SeriesId, SeriesGate>>,
}

impl Level {
    pub fn new(filter: AggregationFilter, store: Arc<dyn Store>, next: Option<Arc<Level>>) -> Self {
        Self {
            filter,
            store,
            next,
            gates: RwLock::new(HashMap::new()),
        }
    }

    pub fn filter(&self) -> &AggregationFilter {
        &self.filter
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn next(&self) -> Option<&Arc<Level>> {
        self.next.as_ref()
    }

    /// Offer an entry to this level's filter
    pub fn insert(&self, series: SeriesId, entry: &Entry) -> Result<()> {
        let gate = self.gate(series);
        let _guard = gate.lock();
        for closed in self.filter.insert(series, entry)? {
            self.forward(series, &closed)?;
        }
        Ok(())
    }

    /// Close the series' open window here and in every later level, then
    /// make each level's store durable for the series
    pub fn flush(&self, series: SeriesId) -> Result<()> {
        {
            let gate = self.gate(series);
            let _guard = gate.lock();
            if let Some(closed) = self.filter.flush(series) {
                self.forward(series, &closed)?;
            }
        }
        self.store.persist(series)?;
        match &self.next {
            Some(next) => next.flush(series),
            None => Ok(()),
        }
    }

    /// Close every open window here and in every later level, then make
    /// every store durable
    pub fn flush_all(&self) -> Result<()> {
        for series in self.filter.open_series() {
            let gate = self.gate(series);
            let _guard = gate.lock();
            if let Some(closed) = self.filter.flush(series) {
                self.forward(series, &closed)?;
            }
        }
        self.store.persist_all()?;
        match &self.next {
            Some(next) => next.flush_all(),
            None => Ok(()),
        }
    }

    fn forward(&self, series: SeriesId, entry: &Entry) -> Result<()> {
        self.store.insert(series, entry)?;
        if let Some(next) = &self.next {
            next.insert(series, entry)?;
        }
        Ok(())
    }

    fn gate(&self, series: SeriesId) -> SeriesGate {
        if let Some(gate) = self.gates.read().get(&series) {
            return gate.clone();
        }
        self.gates
            .write()
            .entry(series)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Querier for Level {
    fn query(
        &self,
        series: SeriesId,
        range: TimeRange,
        attributes: &[String],
        sink: &mut dyn FnMut(Entry) -> Result<()>,
    ) -> Result<()> {
        self.store.query(series, range, attributes, sink)
    }
}
