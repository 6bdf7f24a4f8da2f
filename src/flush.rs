//! Flush cycle: ingestion buffer to local segment files
//!
//! Each tick drains whatever the ingestion buffer holds, sorts the batch by
//! timestamp, mirrors it into the volatile buffer and appends it to the local
//! file of its segment. Batches that cannot be written (disk error, or the
//! segment is mid-upload) stay mirrored and are carried over to the next tick,
//! so a failed write never hides records from queries.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::{unix_seconds, Clock};
use crate::config::FilingPolicy;
use crate::disk::LocalSegments;
use crate::memory::ingest::IngestionBuffer;
use crate::memory::volatile::VolatileBuffer;
use crate::memory::LogRecord;
use crate::segment::{key_for, SegmentKey};

/// Outcome of one flush tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records taken from the ingestion buffer
    pub drained: usize,
    /// Records appended to local files, including retried carry-over
    pub filed: usize,
    /// Records still waiting to be filed after this tick
    pub deferred: usize,
    /// Segments appended to, in write order
    pub segments: Vec<SegmentKey>,
}

#[derive(Debug)]
struct PendingBatch {
    segment: SegmentKey,
    records: Vec<LogRecord>,
}

/// Moves records from the ingestion buffer into local segment files
pub struct FlushCycle {
    ingest: Arc<IngestionBuffer>,
    volatile: Arc<VolatileBuffer>,
    local: Arc<LocalSegments>,
    clock: Arc<dyn Clock>,
    policy: FilingPolicy,
    /// Mirrored batches not yet on disk, oldest first
    carry_over: Vec<PendingBatch>,
    /// Ingestion rejections already reported
    rejected: u64,
}

impl FlushCycle {
    /// Create a flush cycle over the given stages
    pub fn new(
        ingest: Arc<IngestionBuffer>,
        volatile: Arc<VolatileBuffer>,
        local: Arc<LocalSegments>,
        clock: Arc<dyn Clock>,
        policy: FilingPolicy,
    ) -> Self {
        Self {
            ingest,
            volatile,
            local,
            clock,
            policy,
            carry_over: Vec::new(),
            rejected: 0,
        }
    }

    /// Records mirrored but not yet written to disk
    pub fn deferred_records(&self) -> usize {
        self.carry_over.iter().map(|b| b.records.len()).sum()
    }

    /// Run one flush tick
    pub fn tick(&mut self) -> FlushReport {
        let mut report = FlushReport::default();

        // Older batches first so each file keeps flush order
        for batch in std::mem::take(&mut self.carry_over) {
            self.file_or_defer(batch, &mut report);
        }

        let usage = self.ingest.usage_percent();
        let mut drained = self.ingest.drain();
        report.drained = drained.len();
        if !drained.is_empty() {
            // stable: equal timestamps keep arrival order
            drained.sort_by_key(|r| r.timestamp);

            for batch in self.partition(drained) {
                self.volatile.mirror(batch.segment, &batch.records);
                self.file_or_defer(batch, &mut report);
            }
        }

        report.deferred = self.deferred_records();
        let stats = self.ingest.stats();
        if stats.rejected > self.rejected {
            warn!(
                rejected = stats.rejected - self.rejected,
                capacity = stats.capacity,
                "ingestion buffer full, records refused since last flush"
            );
            self.rejected = stats.rejected;
        }
        if report.drained > 0 || report.deferred > 0 {
            debug!(
                drained = report.drained,
                filed = report.filed,
                deferred = report.deferred,
                usage_percent = usage,
                enqueued = stats.enqueued,
                "flush tick"
            );
        }
        report
    }

    /// Split a sorted batch into per-segment batches according to the policy
    fn partition(&self, records: Vec<LogRecord>) -> Vec<PendingBatch> {
        match self.policy {
            FilingPolicy::ArrivalTime => vec![PendingBatch {
                segment: key_for(unix_seconds(self.clock.now())),
                records,
            }],
            FilingPolicy::EventTime => {
                // sorted input keeps each segment's records contiguous
                let mut batches: Vec<PendingBatch> = Vec::new();
                for record in records {
                    let segment = record.segment_key();
                    match batches.last_mut() {
                        Some(batch) if batch.segment == segment => batch.records.push(record),
                        _ => batches.push(PendingBatch {
                            segment,
                            records: vec![record],
                        }),
                    }
                }
                batches
            }
        }
    }

    fn file_or_defer(&mut self, batch: PendingBatch, report: &mut FlushReport) {
        if self.carry_over.iter().any(|b| b.segment == batch.segment) {
            // an earlier batch for this segment is still waiting
            self.carry_over.push(batch);
            return;
        }

        if !self.volatile.begin_write(batch.segment) {
            debug!(segment = %batch.segment, "segment busy uploading, deferring batch");
            self.carry_over.push(batch);
            return;
        }

        let result = self.local.append(batch.segment, &batch.records);
        self.volatile
            .finish_write(batch.segment, result.is_ok(), self.clock.now());

        match result {
            Ok(()) => {
                report.filed += batch.records.len();
                report.segments.push(batch.segment);
            }
            Err(e) => {
                error!(
                    segment = %batch.segment,
                    records = batch.records.len(),
                    error = %e,
                    "failed to append to local segment, will retry"
                );
                self.carry_over.push(batch);
            }
        }
    }
}

impl Drop for FlushCycle {
    fn drop(&mut self) {
        let deferred = self.deferred_records();
        if deferred > 0 {
            warn!(records = deferred, "flush cycle dropped with unfiled records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::memory::volatile::SegmentState;
    use crate::query::RecordFilter;
    use tempfile::{tempdir, TempDir};

    // 2024-01-01T00:00:00Z
    const NEW_YEAR: u64 = 1_704_067_200;

    struct Fixture {
        _dir: TempDir,
        ingest: Arc<IngestionBuffer>,
        volatile: Arc<VolatileBuffer>,
        local: Arc<LocalSegments>,
        clock: Arc<MockClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let local = Arc::new(LocalSegments::open(dir.path()).unwrap());
            Self {
                _dir: dir,
                ingest: Arc::new(IngestionBuffer::new(64)),
                volatile: Arc::new(VolatileBuffer::new()),
                local,
                clock: Arc::new(MockClock::at_unix(NEW_YEAR + 50)),
            }
        }

        fn cycle(&self, policy: FilingPolicy) -> FlushCycle {
            FlushCycle::new(
                self.ingest.clone(),
                self.volatile.clone(),
                self.local.clone(),
                self.clock.clone(),
                policy,
            )
        }

        fn file_records(&self, segment: SegmentKey) -> Vec<LogRecord> {
            let data = self.local.read(segment).unwrap();
            crate::disk::cursor::Cursor::new(&data).collect()
        }
    }

    #[test]
    fn test_tick_sorts_and_files_by_arrival_minute() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::ArrivalTime);
        let ts = NEW_YEAR as i64;
        fx.ingest.submit(LogRecord::new(ts + 40, "second")).unwrap();
        fx.ingest.submit(LogRecord::new(ts + 10, "first")).unwrap();
        // arrival filing ignores the record's own minute
        fx.ingest.submit(LogRecord::new(ts - 3600, "late")).unwrap();

        let report = cycle.tick();
        let segment = key_for(ts);
        assert_eq!(report.drained, 3);
        assert_eq!(report.filed, 3);
        assert_eq!(report.segments, vec![segment]);

        let on_disk = fx.file_records(segment);
        let expected = vec![
            LogRecord::new(ts - 3600, "late"),
            LogRecord::new(ts + 10, "first"),
            LogRecord::new(ts + 40, "second"),
        ];
        assert_eq!(on_disk, expected);
        assert_eq!(fx.volatile.scan(&RecordFilter::new(i64::MIN, i64::MAX, None)), expected);
        assert_eq!(fx.volatile.segment_state(segment), Some(SegmentState::Local));
    }

    #[test]
    fn test_event_time_policy_splits_by_record_minute() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::EventTime);
        let ts = NEW_YEAR as i64;
        fx.ingest.submit(LogRecord::new(ts + 61, "minute one")).unwrap();
        fx.ingest.submit(LogRecord::new(ts + 1, "minute zero")).unwrap();

        let report = cycle.tick();
        assert_eq!(report.segments, vec![key_for(ts), key_for(ts + 60)]);
        assert_eq!(fx.file_records(key_for(ts)), vec![LogRecord::new(ts + 1, "minute zero")]);
        assert_eq!(fx.file_records(key_for(ts + 60)), vec![LogRecord::new(ts + 61, "minute one")]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::ArrivalTime);
        for i in 0..5 {
            fx.ingest.submit(LogRecord::new(7, format!("msg {}", i))).unwrap();
        }
        cycle.tick();

        let messages: Vec<String> = fx
            .file_records(key_for(NEW_YEAR as i64))
            .into_iter()
            .map(|r| r.message)
            .collect();
        assert_eq!(messages, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn test_busy_segment_defers_then_retries() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::ArrivalTime);
        let segment = key_for(NEW_YEAR as i64);

        fx.ingest.submit(LogRecord::new(1, "a")).unwrap();
        cycle.tick();
        let claim = fx.volatile.claim_upload(segment).unwrap();

        fx.ingest.submit(LogRecord::new(2, "b")).unwrap();
        let report = cycle.tick();
        assert_eq!(report.filed, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.volatile.len(), 2, "Deferred records stay queryable");

        fx.volatile.abort_upload(claim);
        let report = cycle.tick();
        assert_eq!(report.filed, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(fx.file_records(segment).len(), 2);
    }

    #[test]
    fn test_write_failure_keeps_records_in_volatile_buffer() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::ArrivalTime);
        let segment = key_for(NEW_YEAR as i64);

        // a directory where the segment file should be makes the append fail
        std::fs::create_dir(fx.local.path(segment)).unwrap();
        fx.ingest.submit(LogRecord::new(3, "stuck")).unwrap();

        let report = cycle.tick();
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.volatile.len(), 1);
        assert!(fx.volatile.claim_upload(segment).is_none(), "Unfiled segment stays local");

        std::fs::remove_dir(fx.local.path(segment)).unwrap();
        let report = cycle.tick();
        assert_eq!(report.filed, 1);
        assert_eq!(fx.file_records(segment), vec![LogRecord::new(3, "stuck")]);
    }

    #[test]
    fn test_empty_tick_is_a_no_op() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::ArrivalTime);
        assert_eq!(cycle.tick(), FlushReport::default());
        assert!(fx.local.list().unwrap().is_empty());
    }

    #[test]
    fn test_rejections_are_reported_once() {
        let fx = Fixture::new();
        let mut cycle = fx.cycle(FilingPolicy::ArrivalTime);
        for i in 0..fx.ingest.capacity() as i64 {
            fx.ingest.submit(LogRecord::new(i, "fill")).unwrap();
        }
        assert!(fx.ingest.submit(LogRecord::new(0, "refused")).is_err());

        cycle.tick();
        assert_eq!(cycle.rejected, 1);
        cycle.tick();
        assert_eq!(cycle.rejected, 1, "No new rejections");
    }
}
