//! Minute-granularity segment keys
//!
//! Every record belongs to exactly one calendar-minute bucket (UTC). The key of
//! a bucket is its start formatted as `YYYY-MM-DD-HH-mm`, which doubles as the
//! local file stem and, behind a namespace prefix, as the remote object key.
//! Because the scheme is a pure function of time, a reader can enumerate every
//! key overlapping a time range without listing storage.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};

/// Extension used for local segment files
pub const SEGMENT_FILE_EXTENSION: &str = "txt";

const KEY_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Identifier of one minute bucket
///
/// Ordering follows time, so sorted keys are chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentKey {
    /// Minutes since the Unix epoch (floored)
    minute: i64,
}

impl SegmentKey {
    /// Key of the minute containing `timestamp` (epoch seconds)
    ///
    /// Timestamps outside the calendar range chrono can represent are clamped
    /// to its first or last minute.
    pub fn for_timestamp(timestamp: i64) -> Self {
        let clamped = timestamp.clamp(
            DateTime::<Utc>::MIN_UTC.timestamp(),
            DateTime::<Utc>::MAX_UTC.timestamp(),
        );
        Self {
            minute: clamped.div_euclid(60),
        }
    }

    /// First second covered by this segment
    pub fn start(&self) -> i64 {
        self.minute * 60
    }

    /// Last second covered by this segment
    pub fn end(&self) -> i64 {
        self.start() + 59
    }

    /// The segment immediately after this one
    pub fn next(&self) -> Self {
        Self {
            minute: self.minute + 1,
        }
    }

    /// Parse a key in canonical `YYYY-MM-DD-HH-mm` form
    ///
    /// Non-canonical spellings (missing zero padding, trailing data) are rejected
    /// so that parsing and formatting stay inverse to each other.
    pub fn parse(s: &str) -> Option<Self> {
        let parsed = NaiveDateTime::parse_from_str(s, KEY_FORMAT).ok()?;
        let key = Self::for_timestamp(parsed.and_utc().timestamp());
        (key.to_string() == s).then_some(key)
    }

    /// Recover a key from a local file name such as `2024-01-01-00-00.txt`
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SEGMENT_FILE_EXTENSION)?.strip_suffix('.')?;
        Self::parse(stem)
    }

    /// Recover a key from a remote object key written under `namespace`
    pub fn from_remote_key(namespace: &str, remote_key: &str) -> Option<Self> {
        Self::parse(remote_key.strip_prefix(namespace)?)
    }

    /// Local file name for this segment
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, SEGMENT_FILE_EXTENSION)
    }

    /// Remote object key for this segment under `namespace`
    pub fn remote_key(&self, namespace: &str) -> String {
        format!("{}{}", namespace, self)
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // for_timestamp clamps into chrono's range, so this always resolves
        let start = DateTime::from_timestamp(self.start(), 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
        write!(f, "{}", start.format(KEY_FORMAT))
    }
}

impl Serialize for SegmentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Segment key for a timestamp in epoch seconds
pub fn key_for(timestamp: i64) -> SegmentKey {
    SegmentKey::for_timestamp(timestamp)
}

/// Every segment key from the minute of `start` through the minute of `end`
///
/// The result is chronological and free of duplicates. The minute containing
/// `end` is included even when `end` is not minute aligned. An inverted range
/// yields no keys.
pub fn keys_spanning(start: i64, end: i64) -> Vec<SegmentKey> {
    if start > end {
        return Vec::new();
    }

    let last = key_for(end);
    let mut keys = Vec::new();
    let mut key = key_for(start);
    while key <= last {
        keys.push(key);
        key = key.next();
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z
    const NEW_YEAR: i64 = 1_704_067_200;

    #[test]
    fn test_key_format() {
        assert_eq!(key_for(NEW_YEAR).to_string(), "2024-01-01-00-00");
        assert_eq!(key_for(NEW_YEAR + 59).to_string(), "2024-01-01-00-00");
        assert_eq!(key_for(NEW_YEAR + 60).to_string(), "2024-01-01-00-01");
        assert_eq!(key_for(NEW_YEAR + 3600 * 13 + 60 * 7 + 5).to_string(), "2024-01-01-13-07");
    }

    #[test]
    fn test_same_minute_same_key() {
        let base = key_for(NEW_YEAR + 120);
        for offset in 0..60 {
            assert_eq!(key_for(NEW_YEAR + 120 + offset), base);
        }
        assert_ne!(key_for(NEW_YEAR + 119), base);
        assert_ne!(key_for(NEW_YEAR + 180), base);
    }

    #[test]
    fn test_negative_timestamps_floor_down() {
        assert_eq!(key_for(-1).to_string(), "1969-12-31-23-59");
        assert_eq!(key_for(-60).to_string(), "1969-12-31-23-59");
        assert_eq!(key_for(-61).to_string(), "1969-12-31-23-58");
        assert_eq!(key_for(0).to_string(), "1970-01-01-00-00");
    }

    #[test]
    fn test_parse_round_trip() {
        let key = key_for(NEW_YEAR + 3_000);
        assert_eq!(SegmentKey::parse(&key.to_string()), Some(key));
        assert_eq!(SegmentKey::parse("2024-1-1-0-0"), None);
        assert_eq!(SegmentKey::parse("2024-01-01-00-00-00"), None);
        assert_eq!(SegmentKey::parse("not a key"), None);
    }

    #[test]
    fn test_file_and_remote_names() {
        let key = key_for(NEW_YEAR);
        assert_eq!(key.file_name(), "2024-01-01-00-00.txt");
        assert_eq!(key.remote_key("segments/"), "segments/2024-01-01-00-00");
        assert_eq!(SegmentKey::from_file_name("2024-01-01-00-00.txt"), Some(key));
        assert_eq!(SegmentKey::from_file_name("2024-01-01-00-00.tmp"), None);
        assert_eq!(SegmentKey::from_remote_key("segments/", "segments/2024-01-01-00-00"), Some(key));
        assert_eq!(SegmentKey::from_remote_key("segments/", "other/2024-01-01-00-00"), None);
    }

    #[test]
    fn test_keys_spanning_includes_unaligned_end() {
        let keys = keys_spanning(NEW_YEAR + 30, NEW_YEAR + 150);
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["2024-01-01-00-00", "2024-01-01-00-01", "2024-01-01-00-02"]);
    }

    #[test]
    fn test_keys_spanning_single_minute() {
        assert_eq!(keys_spanning(NEW_YEAR + 1, NEW_YEAR + 2), vec![key_for(NEW_YEAR)]);
        assert!(keys_spanning(NEW_YEAR + 2, NEW_YEAR + 1).is_empty());
    }

    #[test]
    fn test_keys_spanning_has_no_gaps() {
        let start = NEW_YEAR - 7_777;
        let end = NEW_YEAR + 12_345;
        let keys = keys_spanning(start, end);

        assert_eq!(keys.first(), Some(&key_for(start)));
        assert_eq!(keys.last(), Some(&key_for(end)));
        for pair in keys.windows(2) {
            assert_eq!(pair[0].next(), pair[1], "Keys must be consecutive minutes");
        }
    }

    #[test]
    fn test_keys_spanning_crosses_day_boundary() {
        let keys = keys_spanning(NEW_YEAR - 60, NEW_YEAR);
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["2023-12-31-23-59", "2024-01-01-00-00"]);
    }
}
