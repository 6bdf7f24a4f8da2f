//! Volatile read buffer and segment-state table
//!
//! Every flushed record is mirrored here, tagged with the segment it was filed
//! into and a sequence number, until the upload cycle confirms that segment in
//! the remote store. Queries scan the buffer to see data that is not yet
//! durable remotely.
//!
//! The same lock guards the per-segment lifecycle:
//!
//! ```text
//!  Open ──begin_write──▶ Writing ──finish_write──▶ Local ──claim_upload──▶ Uploading
//!                          ▲                         ▲                        │
//!                          │                         └──────abort_upload──────┤
//!                          └──────────begin_write──── Remote ◀─complete_upload┘
//! ```
//!
//! A `Remote` segment whose local file could not be deleted can be claimed
//! again; the upload cycle then only removes the file.
//!
//! The flush cycle may only append to a segment file between `begin_write`
//! and `finish_write`; the upload cycle may only read and ship it between
//! `claim_upload` and `complete_upload`/`abort_upload`. The two never overlap.
//! A segment with batches that were mirrored but not yet written to disk is
//! never claimed, and retirement only removes entries that were in the buffer
//! when the claim was taken. Together these keep every accepted record in at
//! least one of memory, local disk, or the remote store.

use std::collections::BTreeMap;
use std::time::SystemTime;

use parking_lot::RwLock;

use super::LogRecord;
use crate::query::RecordFilter;
use crate::segment::SegmentKey;

/// Lifecycle position of one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Records mirrored in memory, nothing written to disk yet
    Open,
    /// The flush cycle is appending to the local file
    Writing,
    /// Local file holds the segment and accepts appends
    Local,
    /// The upload cycle is shipping the local file
    Uploading,
    /// Confirmed in the remote store
    Remote,
}

/// Proof of an upload claim, returned by [`VolatileBuffer::claim_upload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadClaim {
    segment: SegmentKey,
    /// Entries with a lower sequence number were on disk when claimed
    seq_limit: u64,
}

impl UploadClaim {
    /// Segment being uploaded
    pub fn segment(&self) -> SegmentKey {
        self.segment
    }
}

#[derive(Debug)]
struct SegmentEntry {
    state: SegmentState,
    /// Mirrored batches not yet appended to the local file
    unfiled: usize,
    /// Time of the last successful append, per the pipeline clock
    last_write: Option<SystemTime>,
}

impl SegmentEntry {
    fn new(state: SegmentState) -> Self {
        Self {
            state,
            unfiled: 0,
            last_write: None,
        }
    }
}

#[derive(Debug)]
struct BufferedRecord {
    seq: u64,
    segment: SegmentKey,
    record: LogRecord,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<BufferedRecord>,
    segments: BTreeMap<SegmentKey, SegmentEntry>,
    next_seq: u64,
}

impl Inner {
    fn push(&mut self, segment: SegmentKey, records: &[LogRecord]) {
        for record in records {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.records.push(BufferedRecord {
                seq,
                segment,
                record: record.clone(),
            });
        }
    }
}

/// Insertion-ordered mirror of not-yet-remote records
#[derive(Debug, Default)]
pub struct VolatileBuffer {
    inner: RwLock<Inner>,
}

impl VolatileBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror a flushed batch that is about to be filed into `segment`
    ///
    /// The batch counts as unfiled until a matching successful
    /// [`finish_write`](Self::finish_write).
    pub fn mirror(&self, segment: SegmentKey, records: &[LogRecord]) {
        let mut inner = self.inner.write();
        inner.push(segment, records);
        let entry = inner
            .segments
            .entry(segment)
            .or_insert_with(|| SegmentEntry::new(SegmentState::Open));
        entry.unfiled += 1;
    }

    /// Register records recovered from a local file left by a previous run
    ///
    /// The segment becomes `Local` with no recorded write time, so the upload
    /// cycle falls back to the file's modification time.
    pub fn adopt(&self, segment: SegmentKey, records: &[LogRecord]) {
        let mut inner = self.inner.write();
        inner.push(segment, records);
        inner
            .segments
            .entry(segment)
            .or_insert_with(|| SegmentEntry::new(SegmentState::Local));
    }

    /// Reserve `segment` for a local append
    ///
    /// Returns `false` while the segment is being uploaded (or already being
    /// written); the caller must retry later.
    pub fn begin_write(&self, segment: SegmentKey) -> bool {
        let mut inner = self.inner.write();
        let entry = inner
            .segments
            .entry(segment)
            .or_insert_with(|| SegmentEntry::new(SegmentState::Open));

        match entry.state {
            SegmentState::Uploading | SegmentState::Writing => false,
            SegmentState::Open | SegmentState::Local | SegmentState::Remote => {
                entry.state = SegmentState::Writing;
                true
            }
        }
    }

    /// Release the reservation taken by [`begin_write`](Self::begin_write)
    ///
    /// `filed` reports whether one mirrored batch reached the local file. The
    /// segment is `Local` afterwards either way, since a failed append may
    /// still have created the file.
    pub fn finish_write(&self, segment: SegmentKey, filed: bool, now: SystemTime) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.segments.get_mut(&segment) {
            entry.state = SegmentState::Local;
            if filed {
                entry.unfiled = entry.unfiled.saturating_sub(1);
                entry.last_write = Some(now);
            }
        }
    }

    /// Claim `segment` for upload
    ///
    /// Succeeds only for a `Local` or `Remote` segment with every mirrored
    /// batch on disk. Segments unknown to the table (files nobody registered)
    /// are adopted as `Local` first.
    pub fn claim_upload(&self, segment: SegmentKey) -> Option<UploadClaim> {
        let mut inner = self.inner.write();
        let seq_limit = inner.next_seq;
        let entry = inner
            .segments
            .entry(segment)
            .or_insert_with(|| SegmentEntry::new(SegmentState::Local));

        let idle = matches!(entry.state, SegmentState::Local | SegmentState::Remote);
        if !idle || entry.unfiled > 0 {
            return None;
        }
        entry.state = SegmentState::Uploading;
        Some(UploadClaim { segment, seq_limit })
    }

    /// Return a failed upload's segment to `Local`
    pub fn abort_upload(&self, claim: UploadClaim) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.segments.get_mut(&claim.segment) {
            if entry.state == SegmentState::Uploading {
                entry.state = SegmentState::Local;
            }
        }
    }

    /// Mark a claimed segment remote and retire its mirrored records
    ///
    /// Only entries mirrored before the claim are removed; anything added
    /// since is still waiting to be filed. Returns the number retired.
    pub fn complete_upload(&self, claim: UploadClaim) -> usize {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.segments.get_mut(&claim.segment) {
            entry.state = SegmentState::Remote;
        }

        let before = inner.records.len();
        inner
            .records
            .retain(|r| r.segment != claim.segment || r.seq >= claim.seq_limit);
        before - inner.records.len()
    }

    /// Drop a `Remote` segment from the table once its local file is gone
    pub fn forget(&self, segment: SegmentKey) {
        let mut inner = self.inner.write();
        let remove = inner
            .segments
            .get(&segment)
            .is_some_and(|entry| entry.state == SegmentState::Remote && entry.unfiled == 0);
        if remove {
            inner.segments.remove(&segment);
        }
    }

    /// Lifecycle state of `segment`, if tracked
    pub fn segment_state(&self, segment: SegmentKey) -> Option<SegmentState> {
        self.inner.read().segments.get(&segment).map(|entry| entry.state)
    }

    /// Time of the last successful append to `segment` in this process
    pub fn last_write(&self, segment: SegmentKey) -> Option<SystemTime> {
        self.inner
            .read()
            .segments
            .get(&segment)
            .and_then(|entry| entry.last_write)
    }

    /// Records matching `filter`, in insertion order
    pub fn scan(&self, filter: &RecordFilter) -> Vec<LogRecord> {
        let inner = self.inner.read();
        inner
            .records
            .iter()
            .filter(|r| filter.matches(&r.record))
            .map(|r| r.record.clone())
            .collect()
    }

    /// Number of mirrored records
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether nothing is mirrored
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}
