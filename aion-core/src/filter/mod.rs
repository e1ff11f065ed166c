//! Aggregation filter
//!
//! Per series, the filter keeps at most one open window `[start, end]` with
//! `end = truncate(start, granularity) + granularity`. Values are folded into
//! one aggregator per (aggregator kind, attribute). When an entry arrives
//! strictly after `end` the window is emitted as one rolled-up [`Entry`]
//! stamped with the window start, the aggregators are reset and the window
//! rolls forward to contain the new entry. A zero granularity emits every
//! entry immediately.
//!
//! The filter does not call downstream code itself: `insert` and `flush`
//! return the closed windows and the owning level decides where they go.

use crate::aggregate::{Aggregator, AggregatorKind};
use crate::types::{add_duration, truncate};
use crate::{AionError, Entry, Result, SeriesId, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Attribute name conventionally used by single-valued series
pub const RAW_ATTRIBUTE: &str = "raw";

/// Name of the rolled-up attribute produced by `kind` over `attribute`.
///
/// `raw` passes the attribute name through, an input named `raw` yields the
/// bare aggregator name, anything else becomes `<attribute>.<aggregator>`.
pub fn output_name(attribute: &str, kind: AggregatorKind) -> String {
    if kind == AggregatorKind::Raw {
        attribute.to_string()
    } else if attribute == RAW_ATTRIBUTE {
        kind.name().to_string()
    } else {
        format!("{}.{}", attribute, kind.name())
    }
}

/// One open aggregation window
#[derive(Debug)]
struct Window {
    start: Timestamp,
    end: Timestamp,
    aggregators: BTreeMap<String, Vec<Aggregator>>,
}

impl Window {
    fn open(ts: Timestamp, granularity: Duration) -> Self {
        let mut window = Self {
            start: ts,
            end: ts,
            aggregators: BTreeMap::new(),
        };
        window.roll(ts, granularity);
        window
    }

    fn roll(&mut self, ts: Timestamp, granularity: Duration) {
        self.start = truncate(ts, granularity);
        self.end = add_duration(self.start, granularity);
    }

    fn fold(&mut self, entry: &Entry, kinds: &[AggregatorKind]) {
        for (attribute, value) in &entry.attributes {
            let aggregators = self
                .aggregators
                .entry(attribute.clone())
                .or_insert_with(|| kinds.iter().map(|k| k.create()).collect());
            for a in aggregators.iter_mut() {
                a.add(*value, entry.timestamp);
            }
        }
    }

    /// Read every non-empty aggregator into an entry and reset them
    fn emit(&mut self) -> Option<Entry> {
        let mut out = Entry::new(self.start);
        for (attribute, aggregators) in self.aggregators.iter_mut() {
            for a in aggregators.iter_mut() {
                if !a.is_empty() {
                    out.attributes.insert(output_name(attribute, a.kind()), a.value());
                }
                a.reset();
            }
        }
        if out.attributes.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

type WindowSlot = Arc<Mutex<Option<Window>>>;

/// Windowing state machine feeding one level's store
pub struct AggregationFilter {
    granularity: Duration,
    kinds: Vec<AggregatorKind>,
    windows: RwLock<HashMap<SeriesId, WindowSlot>>,
}

impl AggregationFilter {
    /// Create a filter from aggregator names; unknown names fail here
    pub fn new<S: AsRef<str>>(granularity: Duration, aggregators: &[S]) -> Result<Self> {
        Self::with_kinds(granularity, AggregatorKind::parse_all(aggregators)?)
    }

    /// Create a filter from already parsed kinds
    pub fn with_kinds(granularity: Duration, kinds: Vec<AggregatorKind>) -> Result<Self> {
        if kinds.is_empty() {
            return Err(AionError::Config(
                "aggregation filter needs at least one aggregator".into(),
            ));
        }
        Ok(Self {
            granularity,
            kinds,
            windows: RwLock::new(HashMap::new()),
        })
    }

    /// Window granularity
    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Configured aggregator kinds
    pub fn kinds(&self) -> &[AggregatorKind] {
        &self.kinds
    }

    /// Fold an entry into its series' window.
    ///
    /// Returns the windows closed by this entry: the previous window when the
    /// entry lies past its end, and the entry's own window when the
    /// granularity is zero.
    pub fn insert(&self, series: SeriesId, entry: &Entry) -> Result<Vec<Entry>> {
        let slot = self.slot(series);
        let mut window = slot.lock();
        self.check_output_names(window.as_ref(), entry)?;
        let mut closed = Vec::new();

        match window.as_mut() {
            None => *window = Some(Window::open(entry.timestamp, self.granularity)),
            Some(open) if entry.timestamp > open.end => {
                closed.extend(open.emit());
                open.roll(entry.timestamp, self.granularity);
            }
            Some(_) => {}
        }

        if let Some(open) = window.as_mut() {
            open.fold(entry, &self.kinds);
        }

        if self.granularity.is_zero() {
            if let Some(mut open) = window.take() {
                closed.extend(open.emit());
            }
        }

        Ok(closed)
    }

    /// Force-emit the series' open window, if any
    pub fn flush(&self, series: SeriesId) -> Option<Entry> {
        let slot = self.windows.read().get(&series).cloned()?;
        let mut window = slot.lock();
        window.take().and_then(|mut open| open.emit())
    }

    /// Series that currently have an open window
    pub fn open_series(&self) -> Vec<SeriesId> {
        let windows = self.windows.read();
        let mut series: Vec<SeriesId> = windows
            .iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .map(|(id, _)| *id)
            .collect();
        series.sort();
        series
    }

    /// Bounds of the series' open window
    pub fn window(&self, series: SeriesId) -> Option<TimeRange> {
        let slot = self.windows.read().get(&series).cloned()?;
        let window = slot.lock();
        window.as_ref().map(|w| TimeRange::new(w.start, w.end))
    }

    /// Reject an entry whose rolled-up names would clash with each other or
    /// with attributes already aggregated for the series
    fn check_output_names(&self, window: Option<&Window>, entry: &Entry) -> Result<()> {
        let known = |attribute: &String| window.map_or(false, |w| w.aggregators.contains_key(attribute));
        if entry.attributes.keys().all(known) {
            return Ok(());
        }

        let mut attributes: BTreeSet<&str> = entry.attributes.keys().map(String::as_str).collect();
        if let Some(w) = window {
            attributes.extend(w.aggregators.keys().map(String::as_str));
        }
        let mut names: HashMap<String, &str> = HashMap::new();
        for attribute in attributes {
            for kind in &self.kinds {
                let name = output_name(attribute, *kind);
                if let Some(other) = names.insert(name.clone(), attribute) {
                    return Err(AionError::InvalidEntry(format!(
                        "attributes '{}' and '{}' both aggregate to '{}'",
                        other, attribute, name
                    )));
                }
            }
        }
        Ok(())
    }

    fn slot(&self, series: SeriesId) -> WindowSlot {
        if let Some(slot) = self.windows.read().get(&series) {
            return slot.clone();
        }
        self.windows
            .write()
            .entry(series)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    const T0: i64 = 1_400_000_040;

    #[test]
    fn test_unknown_aggregator_fails_at_construction() {
        let result = AggregationFilter::new(Duration::from_secs(60), &["min", "p99"]);
        assert!(matches!(result, Err(AionError::UnknownAggregator(_))));
        let empty: [&str; 0] = [];
        assert!(matches!(
            AggregationFilter::new(Duration::from_secs(60), &empty),
            Err(AionError::Config(_))
        ));
    }

    #[test]
    fn test_window_boundary() {
        let g = Duration::from_secs(60);
        let filter = AggregationFilter::new(g, &["count"]).unwrap();
        let series = Uuid::new_v4();

        let t0 = at(T0 + 7);
        assert!(filter.insert(series, &Entry::single(t0, "raw", 1.0)).unwrap().is_empty());
        assert!(filter
            .insert(series, &Entry::single(at(T0 + 7 + 30), "raw", 2.0))
            .unwrap()
            .is_empty());

        let closed = filter
            .insert(series, &Entry::single(at(T0 + 60 + 1), "raw", 3.0))
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].timestamp, at(T0));
        assert_eq!(closed[0].get("count"), Some(2.0));

        // Third entry opened the next window
        let window = filter.window(series).unwrap();
        assert_eq!(window.start, at(T0 + 60));
        assert_eq!(window.end, at(T0 + 120));
        assert_eq!(filter.flush(series).unwrap().get("count"), Some(1.0));
        assert!(filter.window(series).is_none());
    }

    #[test]
    fn test_entry_at_window_end_stays_in_window() {
        let filter = AggregationFilter::new(Duration::from_secs(60), &["count"]).unwrap();
        let series = Uuid::new_v4();
        filter.insert(series, &Entry::single(at(T0), "raw", 1.0)).unwrap();
        let closed = filter.insert(series, &Entry::single(at(T0 + 60), "raw", 1.0)).unwrap();
        assert!(closed.is_empty());
        assert_eq!(filter.flush(series).unwrap().get("count"), Some(2.0));
    }

    #[test]
    fn test_min_max_avg_window() {
        let filter = AggregationFilter::new(Duration::from_secs(60), &["min", "max", "avg"]).unwrap();
        let series = Uuid::new_v4();
        for (i, v) in [79.1, 80.0, 78.2].iter().enumerate() {
            let e = Entry::single(at(T0 + 2 * i as i64), "raw", *v);
            assert!(filter.insert(series, &e).unwrap().is_empty());
        }

        let closed = filter
            .insert(series, &Entry::single(at(T0 + 61), "raw", 50.0))
            .unwrap();
        assert_eq!(closed.len(), 1);
        let e = &closed[0];
        assert!((e.get("min").unwrap() - 78.2).abs() < 1e-9);
        assert!((e.get("max").unwrap() - 80.0).abs() < 1e-9);
        assert!((e.get("avg").unwrap() - 79.1).abs() < 1e-9);
    }

    #[test]
    fn test_zero_granularity_passes_entries_through() {
        let filter = AggregationFilter::new(Duration::ZERO, &["raw"]).unwrap();
        let series = Uuid::new_v4();
        for (i, v) in [79.1, 80.0].iter().enumerate() {
            let ts = Utc.timestamp_opt(T0 + 60 * i as i64, 250_000_000).unwrap();
            let closed = filter.insert(series, &Entry::single(ts, "raw", *v)).unwrap();
            assert_eq!(closed, vec![Entry::single(ts, "raw", *v)]);
        }
        assert!(filter.open_series().is_empty());
    }

    #[test]
    fn test_attribute_pairs_and_sparse_windows() {
        let filter = AggregationFilter::new(Duration::from_secs(60), &["max", "count"]).unwrap();
        let series = Uuid::new_v4();
        filter
            .insert(series, &Entry::single(at(T0), "temp", 20.0).with_attribute("rh", 40.0))
            .unwrap();
        filter.insert(series, &Entry::single(at(T0 + 1), "temp", 22.0)).unwrap();

        let e = filter.flush(series).unwrap();
        assert_eq!(e.get("temp.max"), Some(22.0));
        assert_eq!(e.get("temp.count"), Some(2.0));
        assert_eq!(e.get("rh.max"), Some(40.0));
        assert_eq!(e.get("rh.count"), Some(1.0));

        // rh is absent from the next window entirely
        filter.insert(series, &Entry::single(at(T0 + 90), "temp", 1.0)).unwrap();
        let e = filter.flush(series).unwrap();
        assert_eq!(e.get("rh.max"), None);
        assert_eq!(e.get("temp.max"), Some(1.0));
    }

    #[test]
    fn test_series_are_independent() {
        let filter = AggregationFilter::new(Duration::from_secs(60), &["count"]).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        filter.insert(a, &Entry::single(at(T0), "raw", 1.0)).unwrap();
        let closed = filter.insert(b, &Entry::single(at(T0 + 600), "raw", 1.0)).unwrap();
        assert!(closed.is_empty());
        let mut open = vec![a, b];
        open.sort();
        assert_eq!(filter.open_series(), open);
    }

    #[test]
    fn test_colliding_output_names_rejected() {
        let filter = AggregationFilter::new(Duration::from_secs(60), &["raw", "min"]).unwrap();
        let series = Uuid::new_v4();

        // raw.min and min.raw would both be named "min"
        let clash = Entry::single(at(T0), "raw", 1.0).with_attribute("min", 2.0);
        assert!(matches!(filter.insert(series, &clash), Err(AionError::InvalidEntry(_))));
        assert!(filter.window(series).is_none());

        filter.insert(series, &Entry::single(at(T0), "raw", 1.0)).unwrap();
        let late = Entry::single(at(T0 + 1), "min", 2.0);
        assert!(matches!(filter.insert(series, &late), Err(AionError::InvalidEntry(_))));

        filter.insert(series, &Entry::single(at(T0 + 2), "raw", 3.0)).unwrap();
        let e = filter.flush(series).unwrap();
        assert_eq!(e.get("min"), Some(1.0));
        assert_eq!(e.get("raw"), Some(3.0));
    }

    #[test]
    fn test_output_names() {
        assert_eq!(output_name("raw", AggregatorKind::Avg), "avg");
        assert_eq!(output_name("raw", AggregatorKind::Raw), "raw");
        assert_eq!(output_name("cpu", AggregatorKind::Raw), "cpu");
        assert_eq!(output_name("cpu", AggregatorKind::TimeOfMax), "cpu.tmax");
    }
}
