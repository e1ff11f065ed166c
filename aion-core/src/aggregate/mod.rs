//! Window aggregators
//!
//! Small stateful reducers folded over the values of one attribute inside
//! one aggregation window. Every aggregator receives the timestamp of the
//! value, even when it does not use it, so the time-of-extreme variants share
//! the same call shape as the rest.

use crate::{AionError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of aggregator kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorKind {
    /// Last value added
    Raw,
    /// Number of values added
    Count,
    /// Smallest value
    Min,
    /// Largest value
    Max,
    /// Arithmetic mean
    Avg,
    /// Unix time of the smallest value
    #[serde(rename = "tmin")]
    TimeOfMin,
    /// Unix time of the largest value
    #[serde(rename = "tmax")]
    TimeOfMax,
}

impl AggregatorKind {
    /// All kinds, in factory order
    pub const ALL: [AggregatorKind; 7] = [
        AggregatorKind::Raw,
        AggregatorKind::Count,
        AggregatorKind::Min,
        AggregatorKind::Max,
        AggregatorKind::Avg,
        AggregatorKind::TimeOfMin,
        AggregatorKind::TimeOfMax,
    ];

    /// Configuration name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            AggregatorKind::Raw => "raw",
            AggregatorKind::Count => "count",
            AggregatorKind::Min => "min",
            AggregatorKind::Max => "max",
            AggregatorKind::Avg => "avg",
            AggregatorKind::TimeOfMin => "tmin",
            AggregatorKind::TimeOfMax => "tmax",
        }
    }

    /// Look up a kind by name, failing with `UnknownAggregator`
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name() == name)
            .ok_or_else(|| AionError::UnknownAggregator(name.to_string()))
    }

    /// Parse a whole list of names, failing on the first unknown one
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        names.iter().map(|n| Self::parse(n.as_ref())).collect()
    }

    /// Fresh, empty aggregator of this kind
    pub fn create(&self) -> Aggregator {
        match self {
            AggregatorKind::Raw => Aggregator::Raw { value: 0.0, seen: false },
            AggregatorKind::Count => Aggregator::Count { count: 0 },
            AggregatorKind::Min => Aggregator::Min(Extreme::default()),
            AggregatorKind::Max => Aggregator::Max(Extreme::default()),
            AggregatorKind::Avg => Aggregator::Avg { sum: 0.0, count: 0 },
            AggregatorKind::TimeOfMin => Aggregator::TimeOfMin(Extreme::default()),
            AggregatorKind::TimeOfMax => Aggregator::TimeOfMax(Extreme::default()),
        }
    }
}

impl FromStr for AggregatorKind {
    type Err = AionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Running extreme value and the instant it was observed
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Extreme {
    value: f64,
    at: i64,
    seeded: bool,
}

impl Extreme {
    /// Fold in a value; `replace` decides whether it beats the current one.
    /// The first value after a reset always seeds.
    fn fold(&mut self, value: f64, timestamp: Timestamp, replace: impl Fn(f64, f64) -> bool) {
        if !self.seeded || replace(value, self.value) {
            self.value = value;
            self.at = timestamp.timestamp();
            self.seeded = true;
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A stateful reducer over a stream of values
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregator {
    Raw { value: f64, seen: bool },
    Count { count: u64 },
    Min(Extreme),
    Max(Extreme),
    Avg { sum: f64, count: u64 },
    TimeOfMin(Extreme),
    TimeOfMax(Extreme),
}

impl Aggregator {
    /// Create an aggregator by configuration name
    pub fn new(name: &str) -> Result<Self> {
        Ok(AggregatorKind::parse(name)?.create())
    }

    /// Kind of this aggregator
    pub fn kind(&self) -> AggregatorKind {
        match self {
            Aggregator::Raw { .. } => AggregatorKind::Raw,
            Aggregator::Count { .. } => AggregatorKind::Count,
            Aggregator::Min(_) => AggregatorKind::Min,
            Aggregator::Max(_) => AggregatorKind::Max,
            Aggregator::Avg { .. } => AggregatorKind::Avg,
            Aggregator::TimeOfMin(_) => AggregatorKind::TimeOfMin,
            Aggregator::TimeOfMax(_) => AggregatorKind::TimeOfMax,
        }
    }

    /// Add a value observed at `timestamp`
    pub fn add(&mut self, value: f64, timestamp: Timestamp) {
        match self {
            Aggregator::Raw { value: v, seen } => {
                *v = value;
                *seen = true;
            }
            Aggregator::Count { count } => *count += 1,
            Aggregator::Min(e) | Aggregator::TimeOfMin(e) => e.fold(value, timestamp, |new, cur| new < cur),
            Aggregator::Max(e) | Aggregator::TimeOfMax(e) => e.fold(value, timestamp, |new, cur| new > cur),
            Aggregator::Avg { sum, count } => {
                *sum += value;
                *count += 1;
            }
        }
    }

    /// Current result.
    ///
    /// An `avg` that has seen no values yields NaN; callers check
    /// [`Aggregator::is_empty`] first.
    pub fn value(&self) -> f64 {
        match self {
            Aggregator::Raw { value, .. } => *value,
            Aggregator::Count { count } => *count as f64,
            Aggregator::Min(e) | Aggregator::Max(e) => {
                if e.seeded {
                    e.value
                } else {
                    f64::NAN
                }
            }
            Aggregator::Avg { sum, count } => *sum / *count as f64,
            Aggregator::TimeOfMin(e) | Aggregator::TimeOfMax(e) => {
                if e.seeded {
                    e.at as f64
                } else {
                    f64::NAN
                }
            }
        }
    }

    /// True when nothing was added since the last reset
    pub fn is_empty(&self) -> bool {
        match self {
            Aggregator::Raw { seen, .. } => !*seen,
            Aggregator::Count { count } | Aggregator::Avg { count, .. } => *count == 0,
            Aggregator::Min(e) | Aggregator::Max(e) | Aggregator::TimeOfMin(e) | Aggregator::TimeOfMax(e) => {
                !e.seeded
            }
        }
    }

    /// Reset to the empty state
    pub fn reset(&mut self) {
        match self {
            Aggregator::Raw { value, seen } => {
                *value = 0.0;
                *seen = false;
            }
            Aggregator::Count { count } => *count = 0,
            Aggregator::Min(e) | Aggregator::Max(e) | Aggregator::TimeOfMin(e) | Aggregator::TimeOfMax(e) => e.reset(),
            Aggregator::Avg { sum, count } => {
                *sum = 0.0;
                *count = 0;
            }
        }
    }
}
