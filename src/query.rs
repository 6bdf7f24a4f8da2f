//! Time-range queries over remote segments and the volatile buffer
//!
//! A query derives the minute keys its range spans, reads each remote segment
//! that exists, and unions the matches with the volatile buffer, which holds
//! everything flushed but not yet confirmed remote. Unreadable segments are
//! skipped and reported through [`QueryResult::partial`] instead of failing
//! the query.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::volatile::VolatileBuffer;
use crate::memory::LogRecord;
use crate::remote::RemoteStore;
use crate::segment::{keys_spanning, SegmentKey};

/// Inclusive time range with an optional substring filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    /// First matching second
    pub start: i64,
    /// Last matching second
    pub end: i64,
    /// Case-sensitive substring the message must contain
    pub text: Option<String>,
}

impl RecordFilter {
    /// Build a filter; an empty `text` matches everything
    pub fn new(start: i64, end: i64, text: Option<&str>) -> Self {
        Self {
            start,
            end,
            text: text.filter(|t| !t.is_empty()).map(str::to_string),
        }
    }

    /// Whether `record` lies in the range and contains the text
    pub fn matches(&self, record: &LogRecord) -> bool {
        if record.timestamp < self.start || record.timestamp > self.end {
            return false;
        }
        match &self.text {
            Some(text) => record.message.contains(text.as_str()),
            None => true,
        }
    }
}

/// Records matched by a query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Matches ordered by timestamp (ties keep remote-then-buffer order)
    pub records: Vec<LogRecord>,
    /// Whether some segment could not be read
    pub partial: bool,
    /// Segments skipped because of read or decode failures
    pub unavailable: Vec<SegmentKey>,
}

/// Answers queries against the remote store and the volatile buffer
#[derive(Debug)]
pub struct QueryEngine {
    volatile: Arc<VolatileBuffer>,
    remote: Arc<dyn RemoteStore>,
    namespace: String,
    max_span_secs: i64,
}

impl QueryEngine {
    /// Create an engine reading segments under `namespace`
    pub fn new(
        volatile: Arc<VolatileBuffer>,
        remote: Arc<dyn RemoteStore>,
        namespace: impl Into<String>,
        max_span_secs: i64,
    ) -> Self {
        Self {
            volatile,
            remote,
            namespace: namespace.into(),
            max_span_secs,
        }
    }

    /// Records with `start <= timestamp <= end` whose message contains `text`
    ///
    /// The volatile buffer is snapshotted before remote segments are read, so
    /// a segment whose upload completes mid-query is seen at least once (and
    /// possibly twice) rather than not at all.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRange`] when `start > end`, [`Error::RangeTooLarge`]
    /// when the span exceeds the configured maximum. Storage failures never
    /// fail the query.
    pub fn query(&self, start: i64, end: i64, text: Option<&str>) -> Result<QueryResult> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        let span_secs = end.saturating_sub(start);
        if span_secs > self.max_span_secs {
            return Err(Error::RangeTooLarge {
                span_secs,
                limit_secs: self.max_span_secs,
            });
        }

        let filter = RecordFilter::new(start, end, text);
        let buffered = self.volatile.scan(&filter);

        let mut result = QueryResult::default();
        for key in keys_spanning(start, end) {
            match self.fetch_segment(key) {
                Ok(Some(records)) => result
                    .records
                    .extend(records.into_iter().filter(|r| filter.matches(r))),
                Ok(None) => debug!(segment = %key, "no remote segment"),
                Err(e) => {
                    warn!(segment = %key, error = %e, "skipping unreadable segment");
                    result.partial = true;
                    result.unavailable.push(key);
                }
            }
        }

        result.records.extend(buffered);
        result.records.sort_by_key(|r| r.timestamp);
        Ok(result)
    }

    /// Every remote segment key under the namespace, sorted
    pub fn list_segment_keys(&self) -> Result<Vec<String>> {
        let mut keys = self.remote.list(&self.namespace)?;
        keys.sort();
        Ok(keys)
    }

    /// Decoded contents of one remote segment, `None` if it does not exist
    pub fn fetch_segment(&self, key: SegmentKey) -> Result<Option<Vec<LogRecord>>> {
        let Some(body) = self.remote.get(&key.remote_key(&self.namespace))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&body)?))
    }
}
