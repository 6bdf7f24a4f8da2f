//! Upload cycle: sealed local segments to the remote store
//!
//! Each pass lists the segment files in the data directory and ships every
//! file whose last write is older than the seal delay. Only the part of a file
//! not yet recorded in its upload mark is shipped: it is merged with whatever
//! the remote store already holds under the key, written back as one JSON
//! array, and the mark advanced. The file is then deleted and its mirrored
//! records retired from the volatile buffer.
//!
//! A put is bracketed by two mark writes. Before it, the mark records the
//! prefix about to be shipped as pending; after it, as shipped. A pending
//! prefix found later means the put may or may not have landed, and is counted
//! as shipped only when the remote object already holds all of its records.
//! A file without any mark has its leading records checked against the remote
//! object the same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::disk::cursor::Cursor;
use crate::disk::{FilePrefix, LocalSegment, LocalSegments, UploadMark};
use crate::error::Result;
use crate::memory::volatile::VolatileBuffer;
use crate::memory::LogRecord;
use crate::remote::RemoteStore;
use crate::segment::SegmentKey;

/// Outcome of one upload pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Segments written to the remote store
    pub uploaded: usize,
    /// Segments whose upload failed and will be retried
    pub failed: usize,
    /// Segments left alone: still open, or busy
    pub skipped: usize,
    /// Local records shipped
    pub records: usize,
    /// Volatile-buffer entries retired
    pub retired: usize,
    /// Local files removed, including files already fully remote
    pub deleted: usize,
}

/// Ships sealed local segments to the remote store
pub struct UploadCycle {
    volatile: Arc<VolatileBuffer>,
    local: Arc<LocalSegments>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    seal_delay: Duration,
}

impl UploadCycle {
    /// Create an upload cycle writing under `namespace`
    pub fn new(
        volatile: Arc<VolatileBuffer>,
        local: Arc<LocalSegments>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
        seal_delay: Duration,
    ) -> Self {
        Self {
            volatile,
            local,
            remote,
            clock,
            namespace: namespace.into(),
            seal_delay,
        }
    }

    /// Run one pass over the data directory
    ///
    /// With `force` set every segment is treated as sealed; shutdown uses
    /// this to ship the segment still being written.
    ///
    /// # Errors
    ///
    /// Only listing the data directory can fail the pass. Per-segment
    /// failures are logged, counted in the report, and retried next pass.
    pub fn run_once(&self, force: bool) -> Result<UploadReport> {
        let mut report = UploadReport::default();

        for segment in self.local.list()? {
            if !force && !self.is_sealed(&segment) {
                report.skipped += 1;
                continue;
            }

            let Some(claim) = self.volatile.claim_upload(segment.key) else {
                debug!(segment = %segment.key, "segment busy, skipping upload");
                report.skipped += 1;
                continue;
            };

            match self.upload_segment(segment.key) {
                Ok(records) => {
                    // delete while still claimed so no append can land in between
                    let deleted = self.delete_local(segment.key);
                    let retired = self.volatile.complete_upload(claim);
                    if deleted {
                        self.volatile.forget(segment.key);
                        report.deleted += 1;
                    }
                    report.retired += retired;

                    if records == 0 {
                        debug!(segment = %segment.key, deleted, "segment already in remote store");
                        continue;
                    }
                    info!(
                        segment = %segment.key,
                        records,
                        retired,
                        remote = self.remote.name(),
                        "uploaded segment"
                    );
                    report.uploaded += 1;
                    report.records += records;
                }
                Err(e) => {
                    self.volatile.abort_upload(claim);
                    error!(segment = %segment.key, error = %e, "segment upload failed, will retry");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Whether the segment has not been written to for the seal delay
    fn is_sealed(&self, segment: &LocalSegment) -> bool {
        let last_write = self
            .volatile
            .last_write(segment.key)
            .unwrap_or(segment.modified);
        self.clock
            .now()
            .duration_since(last_write)
            .is_ok_and(|age| age >= self.seal_delay)
    }

    /// Ship the unshipped tail of one claimed segment
    ///
    /// Returns the number of records put; zero when the remote object already
    /// holds the whole file.
    fn upload_segment(&self, key: SegmentKey) -> Result<usize> {
        let data = self.local.read(key)?;
        let mark = match self.local.read_mark(key) {
            Ok(mark) => mark,
            Err(e) => {
                warn!(segment = %key, error = %e, "unreadable upload mark");
                None
            }
        };
        let remote_key = key.remote_key(&self.namespace);

        // fetched at most once per segment
        let mut existing = None;
        let mut shipped;
        match mark {
            Some(mark) => {
                shipped = mark.shipped_len(&data);
                if mark.shipped.is_some() && shipped == 0 {
                    warn!(segment = %key, "upload mark does not match the file, shipping whole file");
                }
                let pending = mark.pending.and_then(|p| p.within(&data));
                if let Some(end) = pending.filter(|&end| end > shipped) {
                    let remote = self.fetch(&remote_key)?;
                    if contains_all(&remote, &parse(key, &data[shipped..end])) {
                        info!(segment = %key, bytes = end - shipped, "previous upload reached remote store");
                        shipped = end;
                    }
                    existing = Some(remote);
                }
            }
            None => {
                let remote = self.fetch(&remote_key)?;
                shipped = leading_overlap(&data, &remote);
                if shipped > 0 {
                    info!(segment = %key, bytes = shipped, "local records already in remote store");
                }
                existing = Some(remote);
            }
        }

        let local = parse(key, &data[shipped..]);
        if local.is_empty() {
            return Ok(0);
        }
        let count = local.len();

        self.local.write_mark(
            key,
            &UploadMark {
                shipped: (shipped > 0).then(|| FilePrefix::of(&data[..shipped])),
                pending: Some(FilePrefix::of(&data)),
            },
        )?;

        let mut records = match existing {
            Some(records) => records,
            None => self.fetch(&remote_key)?,
        };
        if !records.is_empty() {
            debug!(segment = %key, existing = records.len(), "merging with remote segment");
        }
        records.extend(local);
        records.sort_by_key(|r| r.timestamp);

        let body = serde_json::to_vec(&records)?;
        self.remote.put(&remote_key, Bytes::from(body))?;

        self.local.write_mark(
            key,
            &UploadMark {
                shipped: Some(FilePrefix::of(&data)),
                pending: None,
            },
        )?;
        Ok(count)
    }

    /// Records currently stored under `remote_key`
    ///
    /// A corrupt object is an error, so it is never overwritten.
    fn fetch(&self, remote_key: &str) -> Result<Vec<LogRecord>> {
        Ok(match self.remote.get(remote_key)? {
            Some(body) => serde_json::from_slice(&body)?,
            None => Vec::new(),
        })
    }

    fn delete_local(&self, key: SegmentKey) -> bool {
        match self.local.delete(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(segment = %key, error = %e, "failed to delete uploaded segment file");
                false
            }
        }
    }
}

fn parse(key: SegmentKey, data: &[u8]) -> Vec<LogRecord> {
    let mut cursor = Cursor::new(data);
    let records: Vec<LogRecord> = cursor.by_ref().collect();
    if cursor.skipped() > 0 {
        warn!(segment = %key, skipped = cursor.skipped(), "dropped malformed lines from segment");
    }
    records
}

fn counts(records: &[LogRecord]) -> HashMap<&LogRecord, usize> {
    let mut counts = HashMap::new();
    for record in records {
        *counts.entry(record).or_default() += 1;
    }
    counts
}

fn take(counts: &mut HashMap<&LogRecord, usize>, record: &LogRecord) -> bool {
    match counts.get_mut(record) {
        Some(count) if *count > 0 => {
            *count -= 1;
            true
        }
        _ => false,
    }
}

/// Whether every record of `local` is in `remote`, counting duplicates
fn contains_all(remote: &[LogRecord], local: &[LogRecord]) -> bool {
    let mut counts = counts(remote);
    local.iter().all(|record| take(&mut counts, record))
}

/// Byte length of the leading complete lines of `data` whose records
/// `remote` already holds, counting duplicates
fn leading_overlap(data: &[u8], remote: &[LogRecord]) -> usize {
    let mut counts = counts(remote);
    let mut end = 0;
    for line in data.split_inclusive(|&b| b == b'\n') {
        if !line.ends_with(b"\n") {
            break;
        }
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<LogRecord>(line) {
                Ok(record) if take(&mut counts, &record) => {}
                _ => break,
            }
        }
        end += line.len();
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::memory::volatile::SegmentState;
    use crate::remote::{MemoryStore, RemoteError};
    use crate::segment::key_for;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::UNIX_EPOCH;
    use tempfile::{tempdir, TempDir};

    const NS: &str = "segments/";
    // 2024-01-01T00:00:00Z
    const NEW_YEAR: u64 = 1_704_067_200;

    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
        /// Store the object but report the put as failed
        lose_ack: AtomicBool,
    }

    impl RemoteStore for FlakyStore {
        fn put(&self, key: &str, body: Bytes) -> std::result::Result<(), RemoteError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RemoteError::Other("connection reset".to_string()));
            }
            self.inner.put(key, body)?;
            if self.lose_ack.load(Ordering::SeqCst) {
                return Err(RemoteError::Other("timed out".to_string()));
            }
            Ok(())
        }

        fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, RemoteError> {
            self.inner.get(key)
        }

        fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, RemoteError> {
            self.inner.list(prefix)
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct Fixture {
        _dir: TempDir,
        volatile: Arc<VolatileBuffer>,
        local: Arc<LocalSegments>,
        remote: Arc<FlakyStore>,
        clock: Arc<MockClock>,
        cycle: UploadCycle,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let volatile = Arc::new(VolatileBuffer::new());
            let local = Arc::new(LocalSegments::open(dir.path()).unwrap());
            let remote = Arc::new(FlakyStore::default());
            let clock = Arc::new(MockClock::at_unix(NEW_YEAR + 50));
            let cycle = UploadCycle::new(
                volatile.clone(),
                local.clone(),
                remote.clone(),
                clock.clone(),
                NS,
                Duration::from_secs(5),
            );
            Self {
                _dir: dir,
                volatile,
                local,
                remote,
                clock,
                cycle,
            }
        }

        /// File `records` the way the flush cycle does
        fn file(&self, key: SegmentKey, records: &[LogRecord]) {
            self.volatile.mirror(key, records);
            assert!(self.volatile.begin_write(key));
            let result = self.local.append(key, records);
            self.volatile.finish_write(key, result.is_ok(), self.clock.now());
            result.unwrap();
        }

        fn remote_records(&self, key: SegmentKey) -> Vec<LogRecord> {
            let body = self.remote.get(&key.remote_key(NS)).unwrap().unwrap();
            serde_json::from_slice(&body).unwrap()
        }

        /// Ship the file by hand and leave it on disk, as when the local
        /// delete after a successful upload fails
        fn upload_without_delete(&self, key: SegmentKey) {
            let data = self.local.read(key).unwrap();
            let claim = self.volatile.claim_upload(key).unwrap();
            let records: Vec<LogRecord> = Cursor::new(&data).collect();
            self.remote
                .put(&key.remote_key(NS), Bytes::from(serde_json::to_vec(&records).unwrap()))
                .unwrap();
            let mark = UploadMark {
                shipped: Some(FilePrefix::of(&data)),
                pending: None,
            };
            self.local.write_mark(key, &mark).unwrap();
            self.volatile.complete_upload(claim);
        }
    }

    #[test]
    fn test_open_segment_waits_for_seal_delay() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.file(key, &[LogRecord::new(NEW_YEAR as i64 + 10, "a")]);

        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(fx.local.exists(key));
        assert!(fx.remote.inner.is_empty());

        fx.clock.advance(Duration::from_secs(5));
        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.records, 1);
        assert!(!fx.local.exists(key));
    }

    #[test]
    fn test_upload_writes_array_and_retires_buffer() {
        let fx = Fixture::new();
        let ts = NEW_YEAR as i64;
        let key = key_for(ts);
        let records = vec![LogRecord::new(ts + 10, "first"), LogRecord::new(ts + 40, "second")];
        fx.file(key, &records);
        fx.clock.advance(Duration::from_secs(10));

        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.retired, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(fx.remote_records(key), records);
        assert!(fx.volatile.is_empty());
        assert_eq!(fx.volatile.segment_state(key), None, "Uploaded segment is forgotten");
        assert!(fx.remote.inner.get("segments/2024-01-01-00-00").unwrap().is_some());
    }

    #[test]
    fn test_failed_put_keeps_everything_and_retries() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.file(key, &[LogRecord::new(1, "kept")]);
        fx.clock.advance(Duration::from_secs(10));
        fx.remote.failing.store(true, Ordering::SeqCst);

        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.failed, 1);
        assert!(fx.local.exists(key));
        assert_eq!(fx.volatile.len(), 1);
        assert_eq!(fx.volatile.segment_state(key), Some(SegmentState::Local));

        fx.remote.failing.store(false, Ordering::SeqCst);
        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(fx.remote_records(key), vec![LogRecord::new(1, "kept")]);
        assert!(fx.volatile.is_empty());
    }

    #[test]
    fn test_reopened_segment_merges_with_remote() {
        let fx = Fixture::new();
        let ts = NEW_YEAR as i64;
        let key = key_for(ts);
        fx.file(key, &[LogRecord::new(ts + 20, "early")]);
        fx.clock.advance(Duration::from_secs(10));
        fx.cycle.run_once(false).unwrap();

        // a late write for the same minute after the upload
        fx.file(key, &[LogRecord::new(ts + 5, "late")]);
        fx.clock.advance(Duration::from_secs(10));
        fx.cycle.run_once(false).unwrap();

        assert_eq!(
            fx.remote_records(key),
            vec![LogRecord::new(ts + 5, "late"), LogRecord::new(ts + 20, "early")]
        );
        assert_eq!(fx.remote.inner.len(), 1);
    }

    #[test]
    fn test_force_ignores_seal_delay() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.file(key, &[LogRecord::new(1, "now")]);

        let report = fx.cycle.run_once(true).unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(!fx.local.exists(key));
    }

    #[test]
    fn test_busy_segment_is_skipped() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.file(key, &[LogRecord::new(1, "a")]);
        assert!(fx.volatile.begin_write(key));

        let report = fx.cycle.run_once(true).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(fx.local.exists(key));
        fx.volatile.finish_write(key, true, UNIX_EPOCH);
    }

    #[test]
    fn test_adopted_file_uses_modification_time() {
        let fx = Fixture::new();
        let key = key_for(0);
        fx.local.append(key, &[LogRecord::new(0, "from last run")]).unwrap();
        fx.volatile.adopt(key, &[LogRecord::new(0, "from last run")]);

        // file mtime is real time, far after the mock clock
        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.skipped, 1);

        fx.clock.set_time(std::time::SystemTime::now() + Duration::from_secs(60));
        let report = fx.cycle.run_once(false).unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(fx.volatile.is_empty());
    }

    #[test]
    fn test_shipped_file_is_only_deleted() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.file(key, &[LogRecord::new(1, "a")]);
        fx.upload_without_delete(key);
        fx.remote.failing.store(true, Ordering::SeqCst);

        let report = fx.cycle.run_once(true).unwrap();
        assert_eq!(report.uploaded, 0, "No second upload");
        assert_eq!(report.failed, 0);
        assert_eq!(report.deleted, 1);
        assert!(!fx.local.exists(key));
        assert_eq!(fx.local.read_mark(key).unwrap(), None);
        assert_eq!(fx.volatile.segment_state(key), None);
        assert_eq!(fx.remote_records(key), vec![LogRecord::new(1, "a")]);
    }

    #[test]
    fn test_append_after_failed_delete_ships_only_new_records() {
        let fx = Fixture::new();
        let ts = NEW_YEAR as i64;
        let key = key_for(ts);
        fx.file(key, &[LogRecord::new(ts + 1, "a")]);
        fx.upload_without_delete(key);

        fx.file(key, &[LogRecord::new(ts + 2, "b")]);
        fx.clock.advance(Duration::from_secs(10));
        let report = fx.cycle.run_once(false).unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.records, 1, "Only the appended record is shipped");
        assert_eq!(
            fx.remote_records(key),
            vec![LogRecord::new(ts + 1, "a"), LogRecord::new(ts + 2, "b")]
        );
        assert!(!fx.local.exists(key));
        assert!(fx.volatile.is_empty());
    }

    #[test]
    fn test_put_that_landed_is_not_repeated() {
        let fx = Fixture::new();
        let ts = NEW_YEAR as i64;
        let key = key_for(ts);
        let records = vec![LogRecord::new(ts + 10, "a"), LogRecord::new(ts + 40, "b")];
        fx.file(key, &records);

        fx.remote.lose_ack.store(true, Ordering::SeqCst);
        let report = fx.cycle.run_once(true).unwrap();
        assert_eq!(report.failed, 1);
        assert!(fx.local.exists(key));
        assert!(fx.local.read_mark(key).unwrap().unwrap().pending.is_some());

        // a late record for the same minute before the retry
        fx.file(key, &[LogRecord::new(ts + 20, "late")]);
        fx.remote.lose_ack.store(false, Ordering::SeqCst);
        let report = fx.cycle.run_once(true).unwrap();

        assert_eq!(report.records, 1);
        assert_eq!(
            fx.remote_records(key),
            vec![
                LogRecord::new(ts + 10, "a"),
                LogRecord::new(ts + 20, "late"),
                LogRecord::new(ts + 40, "b"),
            ]
        );
        assert!(fx.volatile.is_empty());
    }

    #[test]
    fn test_put_that_never_landed_is_repeated() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.file(key, &[LogRecord::new(1, "a")]);

        fx.remote.failing.store(true, Ordering::SeqCst);
        assert_eq!(fx.cycle.run_once(true).unwrap().failed, 1);
        fx.remote.failing.store(false, Ordering::SeqCst);

        let report = fx.cycle.run_once(true).unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(fx.remote_records(key), vec![LogRecord::new(1, "a")]);
    }

    #[test]
    fn test_unmarked_file_skips_records_already_remote() {
        let fx = Fixture::new();
        let ts = NEW_YEAR as i64;
        let key = key_for(ts);
        let a = LogRecord::new(ts + 10, "a");
        let b = LogRecord::new(ts + 40, "b");
        fx.file(key, &[a.clone()]);

        // shipped and completed without a mark, file left behind
        let claim = fx.volatile.claim_upload(key).unwrap();
        fx.remote
            .put(&key.remote_key(NS), Bytes::from(serde_json::to_vec(&[&a]).unwrap()))
            .unwrap();
        fx.volatile.complete_upload(claim);

        fx.file(key, &[b.clone()]);
        fx.clock.advance(Duration::from_secs(10));
        let report = fx.cycle.run_once(false).unwrap();

        assert_eq!(report.records, 1);
        assert_eq!(fx.remote_records(key), vec![a, b]);
        assert!(!fx.local.exists(key));
    }

    #[test]
    fn test_leading_overlap_stops_at_first_new_record() {
        let a = LogRecord::new(1, "a");
        let b = LogRecord::new(2, "b");
        let data = b"{\"time\":1,\"log\":\"a\"}\n\n{\"time\":2,\"log\":\"b\"}\n{\"time\":1,\"log\":\"a\"}\n";
        let first = data.iter().position(|&b| b == b'\n').unwrap() + 1;

        assert_eq!(leading_overlap(data, &[]), 0);
        assert_eq!(leading_overlap(data, &[a.clone()]), first + 1, "Blank line is included");
        assert_eq!(leading_overlap(data, &[a.clone(), b.clone()]), first + 1 + first);
        assert_eq!(leading_overlap(data, &[a.clone(), a, b]), data.len());
        assert_eq!(leading_overlap(b"{\"time\":1,\"log\":\"a\"}", &[LogRecord::new(1, "a")]), 0, "Torn line is never skipped");
    }

    #[test]
    fn test_contains_all_counts_duplicates() {
        let a = LogRecord::new(1, "a");
        let b = LogRecord::new(2, "b");
        assert!(contains_all(&[a.clone(), b.clone()], &[b.clone()]));
        assert!(contains_all(&[a.clone(), a.clone()], &[a.clone(), a.clone()]));
        assert!(!contains_all(&[a.clone()], &[a.clone(), a.clone()]));
        assert!(!contains_all(&[], &[b]));
        assert!(contains_all(&[], &[]));
    }

    #[test]
    fn test_corrupt_remote_object_is_not_overwritten() {
        let fx = Fixture::new();
        let key = key_for(NEW_YEAR as i64);
        fx.remote
            .put(&key.remote_key(NS), Bytes::from_static(b"garbage"))
            .unwrap();
        fx.file(key, &[LogRecord::new(1, "a")]);

        let report = fx.cycle.run_once(true).unwrap();
        assert_eq!(report.failed, 1);
        assert!(fx.local.exists(key));
        assert_eq!(
            fx.remote.get(&key.remote_key(NS)).unwrap(),
            Some(Bytes::from_static(b"garbage"))
        );
    }
}
