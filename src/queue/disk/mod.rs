//! Disk-backed queue.
//!
//! Crash-recoverable queue built from:
//! - An append-only log of insert/ack frames (`queue.log`)
//! - File locking for single-process access (`.lock`)
//! - CRC32 checksums for corruption detection
//! - Compaction that rewrites the log down to the pending records
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  DiskQueue                   │
//! ├──────────────────────────────────────────────┤
//! │  Mutex<DiskState>          Condvar           │
//! │  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Pending    │  │ QueueLog (append)    │  │
//! │  │ (in memory)  │  │ insert / ack frames  │  │
//! │  └──────────────┘  └──────────┬───────────┘  │
//! │                               ↓              │
//! │                    ┌────────────────────┐    │
//! │                    │  DirLock (flock)   │    │
//! │                    └────────────────────┘    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The pending map is only updated after the matching frame is durable, so
//! the in-memory view never runs ahead of what a restart would recover.

mod codec;
mod dir_lock;
mod log;

pub use dir_lock::{DirLock, LOCK_FILE};
pub use log::{LogEntry, LogEntryKind, QueueLog};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use tracing::{debug, info, warn};

use crate::attribute::Attribute;
use crate::error::QueueError;

use super::cancel::CancelToken;
use super::pending::{wait_for_batch, Pending};
use super::traits::{AttributeQueue, QueuedAttribute};

/// Name of the log file inside the queue directory.
pub const LOG_FILE: &str = "queue.log";

fn lock_err(context: &'static str) -> QueueError {
    QueueError::Backend(format!("poisoned lock: {context}"))
}

/// Tuning for the disk queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskQueueOptions {
    /// Whether to fsync after every frame (slower but survives power loss).
    pub sync_on_write: bool,
    /// Log size that triggers compaction after an ack. When the pending
    /// records alone outgrow it, compaction waits until the log has doubled
    /// since the last rewrite.
    pub max_log_bytes: u64,
}

impl Default for DiskQueueOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_log_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}

#[derive(Debug)]
struct DiskState {
    pending: Pending,
    log: Option<QueueLog>,
    lock: Option<DirLock>,
    /// Log size right after the last compaction.
    compacted_size: u64,
}

impl DiskState {
    fn log(&mut self) -> Result<&mut QueueLog, QueueError> {
        self.log.as_mut().ok_or(QueueError::Closed)
    }
}

/// Queue persisted in a directory; survives process crashes.
#[derive(Debug)]
pub struct DiskQueue {
    dir: PathBuf,
    options: DiskQueueOptions,
    state: Mutex<DiskState>,
    available: Condvar,
}

impl DiskQueue {
    /// Open or create a queue in `dir`, replaying any existing log.
    ///
    /// # Errors
    /// - `Locked` if another process holds the directory
    /// - `Corrupted` if a complete log frame fails its checksum
    /// - `Io` if the directory or log cannot be created
    pub fn open(dir: impl AsRef<Path>, options: DiskQueueOptions) -> Result<Self, QueueError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| QueueError::Io(format!("failed to create queue directory: {e}")))?;

        let lock = DirLock::acquire(dir)?;
        let (log, entries) = QueueLog::open(&dir.join(LOG_FILE), options.sync_on_write)?;

        let mut pending = Pending::new();
        let replayed = entries.len();
        for entry in entries {
            match entry.kind {
                LogEntryKind::Insert {
                    sequence,
                    attribute,
                } => pending.restore(sequence, attribute),
                LogEntryKind::Ack { sequences } => {
                    pending.remove(sequences);
                }
                LogEntryKind::Watermark { next_sequence } => pending.advance_to(next_sequence),
            }
        }

        info!(
            dir = %dir.display(),
            replayed,
            pending = pending.len(),
            "opened disk queue"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            state: Mutex::new(DiskState {
                pending,
                log: Some(log),
                lock: Some(lock),
                compacted_size: 0,
            }),
            available: Condvar::new(),
        })
    }

    /// The queue directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current log size in bytes (0 once closed).
    pub fn log_size_bytes(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().map_err(|_| lock_err("disk queue log size"))?;
        Ok(state.log.as_ref().map_or(0, QueueLog::size_bytes))
    }

    /// Rewrite the log so it holds only pending records.
    ///
    /// # Errors
    /// - `Closed` after [`close`](AttributeQueue::close)
    /// - `Io` if the rewrite fails; after a failure past the rename every
    ///   later write fails too
    pub fn compact(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("disk queue compact"))?;
        Self::compact_locked(&mut state)
    }

    fn compact_locked(state: &mut DiskState) -> Result<(), QueueError> {
        let mut kinds = Vec::with_capacity(state.pending.len() + 1);
        kinds.push(LogEntryKind::Watermark {
            next_sequence: state.pending.peek_sequence(),
        });
        kinds.extend(state.pending.iter().map(|(&sequence, attribute)| LogEntryKind::Insert {
            sequence,
            attribute: attribute.clone(),
        }));

        let log = state.log()?;
        let before = log.size_bytes();
        log.rewrite(kinds)?;
        let after = log.size_bytes();
        state.compacted_size = after;
        debug!(before, after, "compacted queue log");
        Ok(())
    }
}

impl AttributeQueue for DiskQueue {
    fn insert(&self, attribute: Attribute) -> Result<u64, QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("disk queue insert"))?;
        if state.pending.closed {
            return Err(QueueError::Closed);
        }

        let sequence = state.pending.peek_sequence();
        state.log()?.append(LogEntryKind::Insert {
            sequence,
            attribute: attribute.clone(),
        })?;
        state.pending.push(attribute);
        drop(state);

        self.available.notify_all();
        Ok(sequence)
    }

    fn read(&self, max: usize, cancel: &CancelToken) -> Result<Vec<QueuedAttribute>, QueueError> {
        let state = self.state.lock().map_err(|_| lock_err("disk queue read"))?;
        wait_for_batch(&self.available, state, max, cancel, |s| &s.pending)
    }

    fn ack(&self, entries: &[QueuedAttribute]) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("disk queue ack"))?;

        let sequences = state.pending.pending_of(entries);
        if sequences.is_empty() {
            return Ok(());
        }

        state.log()?.append(LogEntryKind::Ack {
            sequences: sequences.clone(),
        })?;
        state.pending.remove(sequences);

        let threshold = self
            .options
            .max_log_bytes
            .max(state.compacted_size.saturating_mul(2));
        if state.log()?.size_bytes() > threshold {
            // The ack is durable in whichever log survives. A rewrite that
            // failed past the rename has poisoned the log, so later writes
            // fail rather than vanish.
            if let Err(e) = Self::compact_locked(&mut state) {
                warn!(error = %e, "queue log compaction failed");
            }
        }
        Ok(())
    }

    fn wake_readers(&self) {
        let _guard = self.state.lock();
        self.available.notify_all();
    }

    fn pending(&self) -> Result<usize, QueueError> {
        Ok(self
            .state
            .lock()
            .map_err(|_| lock_err("disk queue pending"))?
            .pending
            .len())
    }

    fn close(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("disk queue close"))?;
        if state.pending.closed {
            return Ok(());
        }
        state.pending.closed = true;

        let flushed = match state.log.take() {
            Some(mut log) => log.sync(),
            None => Ok(()),
        };
        state.lock.take();
        drop(state);

        self.available.notify_all();
        info!(dir = %self.dir.display(), "closed disk queue");
        flushed
    }
}

impl Drop for DiskQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close disk queue cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::VertexId;
    use tempfile::tempdir;

    fn attr(n: u64) -> Attribute {
        Attribute::new("k", format!("v{n}"), VertexId(n))
    }

    fn fast() -> DiskQueueOptions {
        DiskQueueOptions {
            sync_on_write: false,
            ..DiskQueueOptions::default()
        }
    }

    #[test]
    fn acked_records_stay_acked_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let q = DiskQueue::open(dir.path(), fast()).unwrap();
            for n in 1..=4 {
                q.insert(attr(n)).unwrap();
            }
            let batch = q.read(2, &CancelToken::new()).unwrap();
            q.ack(&batch).unwrap();
        }

        let q = DiskQueue::open(dir.path(), fast()).unwrap();
        let batch = q.read(10, &CancelToken::new()).unwrap();
        let seqs: Vec<u64> = batch.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(q.insert(attr(5)).unwrap(), 5);
    }

    #[test]
    fn compaction_keeps_pending_and_sequence_watermark() {
        let dir = tempdir().unwrap();
        {
            let q = DiskQueue::open(dir.path(), fast()).unwrap();
            for n in 1..=50 {
                q.insert(attr(n)).unwrap();
            }
            let batch = q.read(50, &CancelToken::new()).unwrap();
            q.ack(&batch).unwrap();

            let before = q.log_size_bytes().unwrap();
            q.compact().unwrap();
            assert!(q.log_size_bytes().unwrap() < before);
        }

        let q = DiskQueue::open(dir.path(), fast()).unwrap();
        assert_eq!(q.pending().unwrap(), 0);
        assert_eq!(q.insert(attr(51)).unwrap(), 51);
    }

    #[test]
    fn ack_triggers_compaction_past_threshold() {
        let dir = tempdir().unwrap();
        let q = DiskQueue::open(
            dir.path(),
            DiskQueueOptions {
                sync_on_write: false,
                max_log_bytes: 4 * 1024,
            },
        )
        .unwrap();

        for n in 1..=100 {
            q.insert(attr(n)).unwrap();
        }
        let batch = q.read(99, &CancelToken::new()).unwrap();
        q.ack(&batch).unwrap();

        assert!(q.log_size_bytes().unwrap() <= 4 * 1024);
        assert_eq!(q.pending().unwrap(), 1);
    }

    #[test]
    fn large_backlog_is_not_rewritten_on_every_ack() {
        let dir = tempdir().unwrap();
        let q = DiskQueue::open(
            dir.path(),
            DiskQueueOptions {
                sync_on_write: false,
                max_log_bytes: 4 * 1024,
            },
        )
        .unwrap();

        // The pending records alone are well past the threshold.
        for n in 1..=200 {
            q.insert(attr(n)).unwrap();
        }
        let batch = q.read(200, &CancelToken::new()).unwrap();

        q.ack(&batch[..1]).unwrap();
        let compacted = q.log_size_bytes().unwrap();
        assert!(compacted > 4 * 1024);

        let mut previous = compacted;
        for entry in &batch[1..6] {
            q.ack(std::slice::from_ref(entry)).unwrap();
            let size = q.log_size_bytes().unwrap();
            assert!(size > previous, "ack rewrote the log: {size} <= {previous}");
            previous = size;
        }

        // Acking most of the backlog drops the pending set below the old
        // floor; once the log doubles it is compacted again.
        q.ack(&batch[6..190]).unwrap();
        let mut n = 1000;
        while q.log_size_bytes().unwrap() >= previous {
            previous = q.log_size_bytes().unwrap();
            let seq = q.insert(attr(n)).unwrap();
            q.ack(&[QueuedAttribute {
                sequence: seq,
                attribute: attr(n),
            }])
            .unwrap();
            n += 1;
            assert!(n < 2000, "log never compacted again");
        }
        assert!(q.log_size_bytes().unwrap() < compacted);
        assert_eq!(q.pending().unwrap(), 10);
    }

    #[test]
    fn closed_queue_releases_lock() {
        let dir = tempdir().unwrap();
        let q = DiskQueue::open(dir.path(), fast()).unwrap();
        q.insert(attr(1)).unwrap();
        q.close().unwrap();
        assert_eq!(q.insert(attr(2)), Err(QueueError::Closed));

        let reopened = DiskQueue::open(dir.path(), fast()).unwrap();
        assert_eq!(reopened.pending().unwrap(), 1);
    }
}
