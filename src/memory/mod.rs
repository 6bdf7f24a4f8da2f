//! In-memory stages of the pipeline
//!
//! This module holds the record type and the two memory-resident buffers
//! records pass through:
//!
//! - [`ingest::IngestionBuffer`]: bounded multi-producer queue fed by callers
//!   and drained by the flush cycle
//! - [`volatile::VolatileBuffer`]: mirror of flushed records that have not yet
//!   been confirmed in the remote store, scanned by queries
//!
//! The volatile buffer also owns the segment-state table, so that appends,
//! upload claims and retirement are ordered by a single lock.

pub mod ingest;
pub mod volatile;

use serde::{Deserialize, Serialize};

use crate::segment::{key_for, SegmentKey};

/// One timestamped log line
///
/// Records have no identity beyond their contents; duplicates are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogRecord {
    /// Seconds since the Unix epoch
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// Free-form message text
    #[serde(rename = "log")]
    pub message: String,
}

impl LogRecord {
    /// Create a new record
    pub fn new(timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    /// Segment the record's own timestamp falls into
    pub fn segment_key(&self) -> SegmentKey {
        key_for(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let record = LogRecord::new(1_685_426_738, "test");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"time":1685426738,"log":"test"}"#);

        let back: LogRecord = serde_json::from_str(r#"{"log":"x \"quoted\"","time":-5}"#).unwrap();
        assert_eq!(back, LogRecord::new(-5, "x \"quoted\""));
    }

    #[test]
    fn test_segment_key_follows_timestamp() {
        let record = LogRecord::new(1_704_067_259, "edge");
        assert_eq!(record.segment_key().to_string(), "2024-01-01-00-00");
    }
}
