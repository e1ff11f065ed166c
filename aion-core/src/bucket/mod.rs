//! Buckets: the fixed-duration storage unit of a tier
//!
//! A bucket holds one code stream per attribute plus the reserved `times`
//! stream for one span `[start, start + duration)` of one series. Values are
//! stored fixed point (`round(value * multiplier)`).
//!
//! Every attribute stream carries exactly one code per entry in the `times`
//! stream. An attribute absent from an entry (or a non-finite value) is
//! written as the [`GAP`] code and skipped on decode, so sparse entries never
//! shift the streams against each other.
//!
//! Stream seeds: `times` is seeded with the bucket start in Unix seconds,
//! attribute streams with zero. Both are derivable from the bucket key, so a
//! persisted bucket is decodable without extra metadata.

mod builder;
mod file;
mod repository;
mod store;

pub use builder::MemoryBucketBuilder;
pub use file::FileRepository;
pub use repository::{BucketRepository, MemoryRepository};
pub use store::BucketStore;

use crate::codec::{BucketDecoder, BucketEncoder};
use crate::types::{from_unix_seconds, TIME_ATTRIBUTE};
use crate::{AionError, EncodedAttribute, Entry, Result, TimeRange, Timestamp};
use std::collections::BTreeMap;

/// Fixed-point code marking "attribute absent on this entry"
pub const GAP: i64 = i64::MIN;

/// Seed of every attribute stream
const ATTRIBUTE_BASELINE: i64 = 0;

/// Largest supported precision; 10^18 is the last power of ten in i64 range
pub const MAX_PRECISION: u32 = 18;

/// Scale factor for `precision` decimal digits
pub fn multiplier(precision: u32) -> Result<f64> {
    if precision > MAX_PRECISION {
        return Err(AionError::Config(format!(
            "precision {} exceeds maximum of {}",
            precision, MAX_PRECISION
        )));
    }
    Ok(10f64.powi(precision as i32))
}

/// Float to fixed point.
///
/// Non-finite values become [`GAP`]. A finite value outside the i64 range
/// after scaling is rejected as `InvalidEntry`.
pub fn to_fixed(value: f64, multiplier: f64) -> Result<i64> {
    if !value.is_finite() {
        return Ok(GAP);
    }
    let scaled = (value * multiplier).round();
    // i64::MIN itself is the gap code, so the valid range is open at the bottom
    if !scaled.is_finite() || scaled <= i64::MIN as f64 || scaled >= i64::MAX as f64 {
        return Err(AionError::InvalidEntry(format!(
            "value {} does not fit the fixed-point range at multiplier {}",
            value, multiplier
        )));
    }
    Ok(scaled as i64)
}

/// Fixed point back to float, `None` for a gap
pub fn from_fixed(value: i64, multiplier: f64) -> Option<f64> {
    if value == GAP {
        None
    } else {
        Some(value as f64 / multiplier)
    }
}

/// Reject entries the bucket layout cannot hold
pub(crate) fn validate_entry(entry: &Entry) -> Result<()> {
    if entry.attributes.contains_key(TIME_ATTRIBUTE) {
        return Err(AionError::InvalidEntry(format!(
            "attribute name '{}' is reserved",
            TIME_ATTRIBUTE
        )));
    }
    Ok(())
}

/// An open bucket: one encoder per attribute plus the time stream
#[derive(Debug, Clone)]
pub struct Bucket {
    start: Timestamp,
    times: BucketEncoder,
    attributes: BTreeMap<String, BucketEncoder>,
}

impl Bucket {
    /// Create an empty bucket starting at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            times: BucketEncoder::new(start.timestamp()),
            attributes: BTreeMap::new(),
        }
    }

    /// Rebuild an open bucket from its persisted streams.
    ///
    /// The streams are decoded and re-encoded with the same seeds, so later
    /// writes extend the persisted data instead of replacing it.
    pub fn from_encoded(start: Timestamp, encoded: &[EncodedAttribute]) -> Result<Self> {
        let mut bucket = Self::new(start);
        let Some(times) = encoded.iter().find(|a| a.name == TIME_ATTRIBUTE) else {
            if encoded.is_empty() {
                return Ok(bucket);
            }
            return Err(AionError::Corruption(format!(
                "bucket {} has no '{}' stream",
                start, TIME_ATTRIBUTE
            )));
        };

        let times = BucketDecoder::new(start.timestamp(), &times.data).decode_all()?;
        bucket.times.write(&times);

        for attribute in encoded.iter().filter(|a| a.name != TIME_ATTRIBUTE) {
            let values = BucketDecoder::new(ATTRIBUTE_BASELINE, &attribute.data).decode_all()?;
            if values.len() != times.len() {
                return Err(AionError::Corruption(format!(
                    "bucket {} attribute '{}' has {} values for {} timestamps",
                    start,
                    attribute.name,
                    values.len(),
                    times.len()
                )));
            }
            let mut encoder = BucketEncoder::new(ATTRIBUTE_BASELINE);
            encoder.write(&values);
            bucket.attributes.insert(attribute.name.clone(), encoder);
        }

        Ok(bucket)
    }

    /// Bucket start
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Number of entries written
    pub fn len(&self) -> usize {
        self.times.count()
    }

    /// True when no entry was written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the attribute streams (without `times`)
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Append one entry to every stream
    pub fn write(&mut self, entry: &Entry, multiplier: f64) -> Result<()> {
        validate_entry(entry)?;

        // Convert everything up front so a rejected entry leaves no stream touched
        let mut fixed = BTreeMap::new();
        for (name, value) in &entry.attributes {
            fixed.insert(name.as_str(), to_fixed(*value, multiplier)?);
        }

        // An attribute first seen mid-bucket starts with one gap per earlier entry
        let written = self.len();
        for name in entry.attributes.keys() {
            if !self.attributes.contains_key(name) {
                let mut encoder = BucketEncoder::new(ATTRIBUTE_BASELINE);
                for _ in 0..written {
                    encoder.write_int(GAP);
                }
                self.attributes.insert(name.clone(), encoder);
            }
        }

        self.times.write_int(entry.unix_seconds());
        for (name, encoder) in self.attributes.iter_mut() {
            encoder.write_int(fixed.get(name.as_str()).copied().unwrap_or(GAP));
        }
        Ok(())
    }

    /// Closed copies of every stream, `times` first; empty for an empty bucket
    pub fn encoded(&self) -> Vec<EncodedAttribute> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.attributes.len() + 1);
        out.push(EncodedAttribute::new(TIME_ATTRIBUTE, self.times.snapshot()));
        for (name, encoder) in &self.attributes {
            out.push(EncodedAttribute::new(name.clone(), encoder.snapshot()));
        }
        out
    }

    /// Total encoded size of all streams in bytes
    pub fn encoded_len(&self) -> usize {
        self.times.encoded_len()
            + self
                .attributes
                .values()
                .map(BucketEncoder::encoded_len)
                .sum::<usize>()
    }
}

/// Decode a bucket's streams in lockstep and push the entries within `range`.
///
/// `attributes` selects streams by name; an empty list selects all of them.
/// Requested attributes the bucket does not hold are ignored. With a
/// selection, entries where every selected stream has a gap are skipped.
pub fn decode_entries(
    start: Timestamp,
    encoded: &[EncodedAttribute],
    range: &TimeRange,
    attributes: &[String],
    multiplier: f64,
    sink: &mut dyn FnMut(Entry) -> Result<()>,
) -> Result<()> {
    let Some(times) = encoded.iter().find(|a| a.name == TIME_ATTRIBUTE) else {
        if encoded.is_empty() {
            return Ok(());
        }
        return Err(AionError::Corruption(format!(
            "bucket {} has no '{}' stream",
            start, TIME_ATTRIBUTE
        )));
    };

    let mut times = BucketDecoder::new(start.timestamp(), &times.data);
    let mut streams: Vec<(&str, BucketDecoder<'_>)> = encoded
        .iter()
        .filter(|a| a.name != TIME_ATTRIBUTE)
        .filter(|a| attributes.is_empty() || attributes.iter().any(|n| *n == a.name))
        .map(|a| (a.name.as_str(), BucketDecoder::new(ATTRIBUTE_BASELINE, &a.data)))
        .collect();

    while let Some(secs) = times.read()? {
        let mut entry = Entry::new(from_unix_seconds(secs)?);
        for (name, decoder) in streams.iter_mut() {
            let value = decoder.read()?.ok_or_else(|| {
                AionError::Corruption(format!(
                    "bucket {} attribute '{}' ends before the time stream",
                    start, name
                ))
            })?;
            if let Some(v) = from_fixed(value, multiplier) {
                entry.attributes.insert(name.to_string(), v);
            }
        }

        if !range.contains(entry.timestamp) {
            continue;
        }
        if !attributes.is_empty() && entry.attributes.is_empty() {
            continue;
        }
        sink(entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn collect(bucket: &Bucket, range: TimeRange, attributes: &[String], multiplier: f64) -> Vec<Entry> {
        let mut out = Vec::new();
        decode_entries(bucket.start(), &bucket.encoded(), &range, attributes, multiplier, &mut |e| {
            out.push(e);
            Ok(())
        })
        .unwrap();
        out
    }

    const T0: i64 = 1_400_000_040;

    #[test]
    fn test_fixed_point() {
        let m = multiplier(1).unwrap();
        assert_eq!(to_fixed(79.1, m).unwrap(), 791);
        assert_eq!(to_fixed(-0.05, m).unwrap(), -1);
        assert_eq!(from_fixed(791, m), Some(79.1));
        assert_eq!(to_fixed(f64::NAN, m).unwrap(), GAP);
        assert_eq!(to_fixed(f64::INFINITY, m).unwrap(), GAP);
        assert!(matches!(to_fixed(1e300, m), Err(AionError::InvalidEntry(_))));
        assert!(matches!(to_fixed(-1e18, m), Err(AionError::InvalidEntry(_))));
        assert_eq!(from_fixed(GAP, m), None);
        assert!(multiplier(19).is_err());
    }

    #[test]
    fn test_write_and_decode() {
        let m = 10.0;
        let mut bucket = Bucket::new(at(T0));
        bucket.write(&Entry::single(at(T0), "raw", 79.1), m).unwrap();
        bucket.write(&Entry::single(at(T0 + 2), "raw", 80.0), m).unwrap();
        bucket.write(&Entry::single(at(T0 + 4), "raw", 78.2), m).unwrap();
        assert_eq!(bucket.len(), 3);

        let all = TimeRange::new(at(T0), at(T0 + 59));
        let entries = collect(&bucket, all, &[], m);
        let values: Vec<f64> = entries.iter().map(|e| e.get("raw").unwrap()).collect();
        assert_eq!(values, vec![79.1, 80.0, 78.2]);
        assert_eq!(entries[1].timestamp, at(T0 + 2));

        let narrow = TimeRange::new(at(T0 + 1), at(T0 + 3));
        assert_eq!(collect(&bucket, narrow, &[], m).len(), 1);
    }

    #[test]
    fn test_sparse_attributes_stay_aligned() {
        let m = 100.0;
        let mut bucket = Bucket::new(at(T0));
        bucket.write(&Entry::single(at(T0), "a", 1.0), m).unwrap();
        bucket
            .write(&Entry::single(at(T0 + 1), "b", 2.0).with_attribute("a", 1.5), m)
            .unwrap();
        bucket.write(&Entry::single(at(T0 + 2), "b", 3.0), m).unwrap();

        let range = TimeRange::new(at(T0), at(T0 + 59));
        let entries = collect(&bucket, range, &[], m);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], Entry::single(at(T0), "a", 1.0));
        assert_eq!(entries[1], Entry::single(at(T0 + 1), "a", 1.5).with_attribute("b", 2.0));
        assert_eq!(entries[2], Entry::single(at(T0 + 2), "b", 3.0));

        let only_a = collect(&bucket, range, &["a".to_string()], m);
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|e| e.get("b").is_none()));
    }

    #[test]
    fn test_reserved_attribute_rejected() {
        let mut bucket = Bucket::new(at(T0));
        let result = bucket.write(&Entry::single(at(T0), TIME_ATTRIBUTE, 1.0), 1.0);
        assert!(matches!(result, Err(AionError::InvalidEntry(_))));
        assert!(bucket.is_empty());
        assert!(bucket.encoded().is_empty());
    }

    #[test]
    fn test_overflowing_value_rejected_without_partial_write() {
        let m = 10.0;
        let mut bucket = Bucket::new(at(T0));
        bucket.write(&Entry::single(at(T0), "a", 1.0), m).unwrap();
        let before = bucket.encoded();

        let entry = Entry::single(at(T0 + 1), "a", 2.0).with_attribute("b", 1e18);
        assert!(matches!(bucket.write(&entry, m), Err(AionError::InvalidEntry(_))));
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.encoded(), before);
        assert_eq!(bucket.attribute_names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_rehydrate_extends_persisted_streams() {
        let m = 10.0;
        let mut bucket = Bucket::new(at(T0));
        bucket.write(&Entry::single(at(T0), "raw", 1.0), m).unwrap();
        bucket.write(&Entry::single(at(T0 + 1), "raw", 2.0), m).unwrap();
        let persisted = bucket.encoded();

        let mut restored = Bucket::from_encoded(at(T0), &persisted).unwrap();
        assert_eq!(restored.encoded(), persisted);
        restored.write(&Entry::single(at(T0 + 2), "raw", 3.0), m).unwrap();

        let range = TimeRange::new(at(T0), at(T0 + 59));
        let values: Vec<f64> = collect(&restored, range, &[], m)
            .iter()
            .map(|e| e.get("raw").unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_misaligned_streams_are_corruption() {
        let mut bucket = Bucket::new(at(T0));
        bucket.write(&Entry::single(at(T0), "raw", 1.0), 1.0).unwrap();
        bucket.write(&Entry::single(at(T0 + 1), "raw", 2.0), 1.0).unwrap();
        let mut encoded = bucket.encoded();
        encoded[1].data = crate::codec::encode(0, &[1]);

        assert!(matches!(
            Bucket::from_encoded(at(T0), &encoded),
            Err(AionError::Corruption(_))
        ));
        let range = TimeRange::new(at(T0), at(T0 + 59));
        let result = decode_entries(at(T0), &encoded, &range, &[], 1.0, &mut |_| Ok(()));
        assert!(matches!(result, Err(AionError::Corruption(_))));
    }
}
