//! Segment Log - minute-segmented log ingestion with local staging and
//! object store upload.
//!
//! # Overview
//!
//! Records (`{time, log}` pairs) pass through three stages:
//!
//! 1. A bounded MPSC ingestion buffer that producers submit to without blocking
//! 2. Append-only local segment files, one per UTC minute, fed by a flush daemon
//! 3. A remote object store, fed by an upload daemon once a segment goes quiet
//!
//! Every flushed record is also mirrored in a volatile read buffer until its
//! segment is confirmed remote, so queries see data that has not been uploaded
//! yet. Queries union the remote segments a time range spans with that buffer.
//!
//! # Key Features
//!
//! - Backpressure instead of dropping records when the ingestion buffer is full
//! - Explicit writer/uploader exclusion per segment
//! - Per-segment retirement of buffered records after a confirmed upload
//! - Merging uploads, so a late write never replaces an uploaded segment
//! - Upload marks, so a repeated upload never stores a record twice
//! - Recovery of local segment files left by a previous run
//! - Graceful shutdown that drains every stage
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use segment_log::{LogRecord, MemoryStore, Pipeline, PipelineConfig};
//!
//! # fn main() -> segment_log::Result<()> {
//! let pipeline = Pipeline::open(PipelineConfig::default(), Arc::new(MemoryStore::new()))?;
//! pipeline.start()?;
//!
//! pipeline.submit(LogRecord::new(1_704_067_210, "service started"))?;
//! let result = pipeline.query(1_704_067_200, 1_704_067_259, Some("started"))?;
//! assert!(!result.partial);
//!
//! pipeline.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod clock;
pub mod config;
pub mod disk;
pub mod error;
pub mod flush;
pub mod memory;
pub mod query;
pub mod remote;
pub mod segment;
pub mod server;
pub mod upload;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{Config, FilingPolicy, ObjectStoreConfig, PipelineConfig};
pub use error::{BatchRejected, Error, Result};
pub use flush::{FlushCycle, FlushReport};
pub use memory::ingest::IngestStats;
pub use memory::LogRecord;
pub use query::{QueryEngine, QueryResult, RecordFilter};
pub use remote::{build_remote, MemoryStore, RemoteError, RemoteStore};
pub use segment::{key_for, keys_spanning, SegmentKey};
pub use upload::{UploadCycle, UploadReport};

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use disk::cursor::Cursor;
use disk::LocalSegments;
use memory::ingest::IngestionBuffer;
use memory::volatile::VolatileBuffer;

/// A background thread running one cycle at a fixed interval
struct Daemon {
    name: &'static str,
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Daemon {
    fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        // never sent on; dropping the sender is the stop signal
        let (stop, stopped) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { name, stop, handle })
    }

    /// Signal the thread and wait for its current iteration to finish
    fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            error!(daemon = self.name, "daemon thread panicked");
        }
    }
}

#[derive(Default)]
struct Daemons {
    flush: Option<Daemon>,
    upload: Option<Daemon>,
}

/// The ingestion-to-query pipeline
///
/// Owns every stage and the two daemons that move records between them.
/// All methods take `&self`; share the pipeline behind an `Arc`.
pub struct Pipeline {
    config: PipelineConfig,
    ingest: Arc<IngestionBuffer>,
    volatile: Arc<VolatileBuffer>,
    local: Arc<LocalSegments>,
    query: QueryEngine,
    flush: Arc<Mutex<FlushCycle>>,
    upload: Arc<UploadCycle>,
    daemons: Mutex<Daemons>,
}

impl Pipeline {
    /// Open the pipeline on the system clock
    ///
    /// See [`with_clock`](Self::with_clock).
    pub fn open(config: PipelineConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::with_clock(config, remote, Arc::new(SystemClock))
    }

    /// Open the pipeline with an explicit clock
    ///
    /// Creates the data directory if needed and adopts any segment files a
    /// previous run left behind: their records become queryable immediately
    /// and the upload daemon ships them once they are sealed. Daemons are not
    /// started; call [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for invalid settings, [`Error::LocalIo`] if
    /// the data directory cannot be created or read.
    pub fn with_clock(
        config: PipelineConfig,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let ingest = Arc::new(IngestionBuffer::new(config.ingest_capacity));
        let volatile = Arc::new(VolatileBuffer::new());
        let local = Arc::new(LocalSegments::open(&config.data_dir)?);
        recover(&local, &volatile)?;

        let query = QueryEngine::new(
            volatile.clone(),
            remote.clone(),
            config.namespace.clone(),
            config.max_query_span_secs,
        );
        let flush = FlushCycle::new(
            ingest.clone(),
            volatile.clone(),
            local.clone(),
            clock.clone(),
            config.filing_policy,
        );
        let upload = UploadCycle::new(
            volatile.clone(),
            local.clone(),
            remote,
            clock,
            config.namespace.clone(),
            config.seal_delay(),
        );

        Ok(Self {
            config,
            ingest,
            volatile,
            local,
            query,
            flush: Arc::new(Mutex::new(flush)),
            upload: Arc::new(upload),
            daemons: Mutex::new(Daemons::default()),
        })
    }

    /// Start the flush and upload daemons
    ///
    /// Does nothing if they are already running.
    pub fn start(&self) -> Result<()> {
        let mut daemons = self.daemons.lock();
        if self.ingest.is_closed() {
            return Err(Error::Closed);
        }

        if daemons.flush.is_none() {
            let flush = self.flush.clone();
            daemons.flush = Some(Daemon::spawn(
                "segment-log-flush",
                self.config.flush_interval(),
                move || {
                    flush.lock().tick();
                },
            )?);
        }

        if daemons.upload.is_none() {
            let upload = self.upload.clone();
            daemons.upload = Some(Daemon::spawn(
                "segment-log-upload",
                self.config.upload_interval(),
                move || {
                    if let Err(e) = upload.run_once(false) {
                        error!(error = %e, "upload pass failed");
                    }
                },
            )?);
        }

        info!(
            data_dir = %self.config.data_dir.display(),
            namespace = %self.config.namespace,
            "pipeline started"
        );
        Ok(())
    }

    /// Submit one record without blocking
    ///
    /// # Errors
    ///
    /// [`Error::Backpressure`] when the ingestion buffer is full,
    /// [`Error::Closed`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, record: LogRecord) -> Result<()> {
        self.ingest.submit(record)
    }

    /// Submit records in order, stopping at the first refusal
    pub fn submit_batch(&self, records: Vec<LogRecord>) -> std::result::Result<usize, BatchRejected> {
        self.ingest.submit_batch(records)
    }

    /// Records with `start <= time <= end` whose message contains `text`
    ///
    /// Blocks on remote reads; call from a blocking context.
    pub fn query(&self, start: i64, end: i64, text: Option<&str>) -> Result<QueryResult> {
        self.query.query(start, end, text)
    }

    /// Every remote segment key under the namespace, sorted
    pub fn list_segment_keys(&self) -> Result<Vec<String>> {
        self.query.list_segment_keys()
    }

    /// Run one flush tick on the calling thread
    pub fn flush_now(&self) -> FlushReport {
        self.flush.lock().tick()
    }

    /// Run one upload pass on the calling thread
    ///
    /// With `force` set the seal delay is ignored.
    pub fn upload_now(&self, force: bool) -> Result<UploadReport> {
        self.upload.run_once(force)
    }

    /// Stop accepting records and drain every stage
    ///
    /// Closes the ingestion buffer, stops the flush daemon and runs a final
    /// flush, then stops the upload daemon and runs a final upload pass that
    /// ignores the seal delay. Records that still could not be shipped stay in
    /// their local files for the next run to recover. Safe to call twice.
    pub fn shutdown(&self) -> Result<()> {
        self.ingest.close();

        let mut daemons = self.daemons.lock();
        if let Some(flush) = daemons.flush.take() {
            flush.stop();
        }
        let flushed = self.flush_now();
        if flushed.deferred > 0 {
            warn!(records = flushed.deferred, "records left unfiled at shutdown");
        }

        if let Some(upload) = daemons.upload.take() {
            upload.stop();
        }
        let uploaded = self.upload_now(true)?;
        if uploaded.failed > 0 {
            warn!(
                segments = uploaded.failed,
                "segments left in the data directory at shutdown"
            );
        }

        info!(
            flushed = flushed.filed,
            uploaded = uploaded.uploaded,
            "pipeline shut down"
        );
        Ok(())
    }

    /// Whether the daemons are running
    pub fn is_running(&self) -> bool {
        let daemons = self.daemons.lock();
        daemons.flush.is_some() || daemons.upload.is_some()
    }

    /// Counters of the ingestion buffer
    pub fn ingest_stats(&self) -> IngestStats {
        self.ingest.stats()
    }

    /// Records flushed but not yet confirmed remote
    pub fn buffered_records(&self) -> usize {
        self.volatile.len()
    }

    /// Directory holding local segment files
    pub fn data_dir(&self) -> &Path {
        self.local.dir()
    }

    /// Settings the pipeline was opened with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let daemons = std::mem::take(self.daemons.get_mut());
        for daemon in [daemons.flush, daemons.upload].into_iter().flatten() {
            daemon.stop();
        }
    }
}

/// Load segment files left by a previous run into the volatile buffer
///
/// Records an upload mark shows as already remote are not buffered again.
fn recover(local: &LocalSegments, volatile: &VolatileBuffer) -> Result<()> {
    let mut segments = 0;
    let mut records = 0;
    for segment in local.list()? {
        let data = local.read(segment.key)?;
        let shipped = match local.read_mark(segment.key) {
            Ok(mark) => mark.map_or(0, |mark| mark.shipped_len(&data)),
            Err(e) => {
                warn!(segment = %segment.key, error = %e, "ignoring unreadable upload mark");
                0
            }
        };
        let recovered: Vec<LogRecord> = Cursor::new(&data[shipped..]).collect();
        records += recovered.len();
        segments += 1;
        volatile.adopt(segment.key, &recovered);
    }

    if segments > 0 {
        info!(segments, records, "recovered local segments");
    }
    Ok(())
}
