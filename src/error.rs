//! Error types shared across the pipeline
//!
//! Failures are isolated per record and per segment wherever possible: the
//! flush and upload cycles log and retry, the query engine skips what it
//! cannot read. Only configuration errors are fatal, and only at startup.

use std::io;

use crate::remote::RemoteError;

/// Errors surfaced by the public pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An ingest or query payload could not be understood
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The ingestion buffer is at capacity
    #[error("ingestion buffer full ({capacity} records)")]
    Backpressure {
        /// Configured capacity of the ingestion buffer
        capacity: usize,
    },

    /// The pipeline is shutting down and no longer accepts records
    #[error("pipeline is closed")]
    Closed,

    /// Query start lies after query end
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        /// Requested start, epoch seconds
        start: i64,
        /// Requested end, epoch seconds
        end: i64,
    },

    /// Query spans more minutes than the configured limit
    #[error("range of {span_secs}s exceeds the limit of {limit_secs}s")]
    RangeTooLarge {
        /// Requested span in seconds
        span_secs: i64,
        /// Configured maximum span in seconds
        limit_secs: i64,
    },

    /// Local segment file I/O failed
    #[error("local I/O error: {0}")]
    LocalIo(#[from] io::Error),

    /// The remote object store failed
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Startup configuration is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// A batch submission that stopped part way through
///
/// Records before the failing one were enqueued and will be flushed; the
/// failing record and everything after it were not.
#[derive(Debug, thiserror::Error)]
#[error("accepted {accepted} of {total} records: {source}")]
pub struct BatchRejected {
    /// Records enqueued before the failure
    pub accepted: usize,
    /// Records in the submitted batch
    pub total: usize,
    /// Why the remaining records were refused
    #[source]
    pub source: Error,
}
