//! Core data types used throughout the query engine
//!
//! This module defines the fundamental data structures shared across the
//! planning and execution layers:
//!
//! # Key Types
//!
//! - **`TimeRange`**: Time window for queries (start inclusive, end exclusive)
//! - **`TagSet`**: Key-value metadata tags for series (e.g. host=server1)
//! - **`FieldType`**: The value type of a field or expression result
//!
//! # Example
//!
//! ```rust
//! use meridian_tsdb::types::{TagSet, TimeRange};
//!
//! let range = TimeRange::new(1000, 2000).unwrap();
//! assert!(range.contains(1500));
//!
//! let mut tags = TagSet::new();
//! tags.insert("host", "server1");
//! tags.insert("dc", "us-east");
//! assert_eq!(tags.get("host"), Some("server1"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Minimum representable timestamp in nanoseconds.
///
/// Two above `i64::MIN` so that unbounded ranges can still be widened by a
/// nanosecond in either direction without overflow.
pub const MIN_TIME: i64 = i64::MIN + 2;

/// Maximum representable timestamp in nanoseconds.
pub const MAX_TIME: i64 = i64::MAX - 1;

/// Number of nanoseconds in one second.
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Time window for queries.
///
/// The range is inclusive of `start` and exclusive of `end`, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: i64,
    /// End timestamp (exclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range, validating that start precedes end
    pub fn new(start: i64, end: i64) -> Result<Self, String> {
        if start > end {
            return Err(format!(
                "invalid time range: start {} is after end {}",
                start, end
            ));
        }
        Ok(Self { start, end })
    }

    /// The unbounded range covering every representable timestamp
    pub fn unbounded() -> Self {
        Self {
            start: MIN_TIME,
            end: MAX_TIME,
        }
    }

    /// Check whether a timestamp falls inside the range
    #[inline]
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Duration of the range in nanoseconds
    #[inline]
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }

    /// Intersect with another range, returning the overlapping window
    pub fn intersect(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }
}

/// The value type of a field or expression result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// 64-bit floating point
    Float,
    /// 64-bit signed integer
    Integer,
    /// 64-bit unsigned integer
    Unsigned,
    /// UTF-8 string
    String,
    /// Boolean
    Boolean,
    /// Timestamp column
    Time,
    /// Group-by tag column
    Tag,
    /// Type could not be determined statically
    Unknown,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Unsigned => "unsigned",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Time => "time",
            FieldType::Tag => "tag",
            FieldType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Ordered key-value tags attached to a series.
///
/// Tags are kept in a sorted map so that tag sets compare, hash, and render
/// deterministically; row alignment across scanners matches on the exact
/// (time, tag set) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a tag key-value pair
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a tag value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the tag set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over tag key-value pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Project the tag set onto a subset of keys.
    ///
    /// Keys absent from the tag set are simply omitted.
    pub fn project<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> TagSet {
        let mut out = TagSet::new();
        for key in keys {
            if let Some(value) = self.get(key) {
                out.insert(key, value);
            }
        }
        out
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(1000, 2000).unwrap();
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
        assert!(!range.contains(999));
    }

    #[test]
    fn test_time_range_invalid() {
        assert!(TimeRange::new(2000, 1000).is_err());
    }

    #[test]
    fn test_time_range_intersect() {
        let a = TimeRange::new(0, 100).unwrap();
        let b = TimeRange::new(50, 200).unwrap();
        let c = a.intersect(&b);
        assert_eq!(c.start, 50);
        assert_eq!(c.end, 100);
    }

    #[test]
    fn test_tag_set_ordering() {
        let mut a = TagSet::new();
        a.insert("host", "a");
        a.insert("dc", "east");

        let mut b = TagSet::new();
        b.insert("dc", "east");
        b.insert("host", "a");

        // Insertion order must not affect equality or rendering.
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "dc=east,host=a");
    }

    #[test]
    fn test_tag_set_project() {
        let mut tags = TagSet::new();
        tags.insert("host", "a");
        tags.insert("dc", "east");
        tags.insert("rack", "12");

        let projected = tags.project(["host", "missing"]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("host"), Some("a"));
    }
}
