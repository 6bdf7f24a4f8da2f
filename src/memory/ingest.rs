//! Bounded multi-producer ingestion queue
//!
//! Callers (typically HTTP handlers) submit records concurrently; the flush
//! cycle is the only consumer and drains whatever is available on each tick.
//! The queue never blocks a producer: when it is full the submission fails with
//! [`Error::Backpressure`] so the caller can answer promptly.
//!
//! No ordering is promised across producers. The flush cycle sorts each
//! drained batch by timestamp.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

use super::LogRecord;
use crate::error::{BatchRejected, Error, Result};

/// Multi-producer, single-consumer record queue
pub struct IngestionBuffer {
    sender: Sender<LogRecord>,
    receiver: Receiver<LogRecord>,
    capacity: usize,
    /// Set once shutdown begins; producers hold the read side while sending
    closed: RwLock<bool>,
    enqueued: CachePadded<AtomicU64>,
    dequeued: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
}

/// Point-in-time counters of an [`IngestionBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    /// Records currently queued
    pub len: usize,
    /// Maximum number of queued records
    pub capacity: usize,
    /// Records ever accepted
    pub enqueued: u64,
    /// Records ever drained
    pub dequeued: u64,
    /// Submissions refused because the queue was full
    pub rejected: u64,
}

impl IngestionBuffer {
    /// Create a queue holding at most `capacity` records (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            closed: RwLock::new(false),
            enqueued: CachePadded::new(AtomicU64::new(0)),
            dequeued: CachePadded::new(AtomicU64::new(0)),
            rejected: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue one record without blocking
    ///
    /// # Errors
    ///
    /// [`Error::Backpressure`] when the queue is full, [`Error::Closed`] once
    /// [`close`](Self::close) has been called.
    pub fn submit(&self, record: LogRecord) -> Result<()> {
        let closed = self.closed.read();
        if *closed {
            return Err(Error::Closed);
        }

        match self.sender.try_send(record) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::Backpressure {
                    capacity: self.capacity,
                })
            }
            // Both ends live in self, so this only happens while tearing down
            Err(TrySendError::Disconnected(_)) => Err(Error::Closed),
        }
    }

    /// Enqueue records in order, stopping at the first refusal
    ///
    /// Returns the number of records accepted.
    pub fn submit_batch(
        &self,
        records: Vec<LogRecord>,
    ) -> std::result::Result<usize, BatchRejected> {
        let total = records.len();
        for (accepted, record) in records.into_iter().enumerate() {
            if let Err(source) = self.submit(record) {
                return Err(BatchRejected {
                    accepted,
                    total,
                    source,
                });
            }
        }
        Ok(total)
    }

    /// Take every record currently queued without waiting for more
    pub fn drain(&self) -> Vec<LogRecord> {
        let records: Vec<LogRecord> = self.receiver.try_iter().collect();
        if !records.is_empty() {
            self.dequeued
                .fetch_add(records.len() as u64, Ordering::Relaxed);
        }
        records
    }

    /// Refuse all further submissions
    ///
    /// When this returns, no submission is still in flight, so a subsequent
    /// [`drain`](Self::drain) observes every accepted record.
    pub fn close(&self) {
        *self.closed.write() = true;
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Records currently queued
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Maximum number of queued records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current fill level as a percentage of capacity
    pub fn usage_percent(&self) -> f32 {
        (self.len() as f32 / self.capacity as f32) * 100.0
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            len: self.len(),
            capacity: self.capacity,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
