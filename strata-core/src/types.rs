//! Core types for Strata

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Timestamp in caller-defined units (milliseconds for the calendar finders)
pub type Timestamp = i64;

/// Smallest representable timestamp
pub const MIN_TIME: Timestamp = i64::MIN;

/// Largest representable timestamp
pub const MAX_TIME: Timestamp = i64::MAX;

/// Identity of one independent time series (e.g. an instrument symbol)
pub trait SeriesKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Stable string identity, used for directory names and index keys
    fn hash_key(&self) -> String;
}

impl SeriesKey for String {
    fn hash_key(&self) -> String {
        self.clone()
    }
}

impl SeriesKey for u64 {
    fn hash_key(&self) -> String {
        self.to_string()
    }
}

/// A value stored in a series.
///
/// The engine only looks at the two time projections. Values of one key
/// must arrive with non-decreasing `start_time`, and `end_time` of a value
/// must not exceed `start_time` of the next one.
pub trait TimeSeriesValue: Clone + Send + Sync + 'static {
    /// Start of the interval covered by this value
    fn start_time(&self) -> Timestamp;

    /// End of the interval; this is the index time of the value
    fn end_time(&self) -> Timestamp {
        self.start_time()
    }
}

/// Bare timestamps, for series where the time is the whole value
impl TimeSeriesValue for i64 {
    fn start_time(&self) -> Timestamp {
        *self
    }
}

/// Time range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub from: Timestamp,
    /// End timestamp (inclusive)
    pub to: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    /// Range covering every timestamp
    pub fn all() -> Self {
        Self::new(MIN_TIME, MAX_TIME)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.from && ts <= self.to
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.from <= other.to && self.to >= other.from
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// A key together with one of its segments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentedKey<K> {
    pub key: K,
    pub segment: TimeRange,
}

impl<K: SeriesKey> SegmentedKey<K> {
    pub fn new(key: K, segment: TimeRange) -> Self {
        Self { key, segment }
    }
}

impl<K: SeriesKey> fmt::Display for SegmentedKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.key.hash_key(), self.segment)
    }
}

/// Outcome of moving `n` values away from an anchor value
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Shifted<V> {
    Found(V),
    /// The first (or last) value was reached with `remaining` steps left
    Exhausted { remaining: u64 },
}

/// Percent-escape a hash key so it can be used as a single path component
pub(crate) fn fs_safe(hash_key: &str) -> String {
    let mut out = String::with_capacity(hash_key.len());
    for b in hash_key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(150));
        assert!(range1.contains(200));
        assert!(!range1.contains(250));
    }

    #[test]
    fn test_fs_safe() {
        assert_eq!(fs_safe("EURUSD"), "EURUSD");
        assert_eq!(fs_safe("a/b"), "a%2Fb");
        assert_eq!(fs_safe(".."), "%2E.");
        assert_eq!(fs_safe(""), "%");
    }

    #[test]
    fn test_segmented_key_display() {
        let key = SegmentedKey::new("asdf".to_string(), TimeRange::new(0, 9));
        assert_eq!(key.to_string(), "asdf[0, 9]");
    }
}
