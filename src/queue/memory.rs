//! In-memory queue backend.
//!
//! Records live for the lifetime of the process only. Intended for tests and
//! deployments that accept losing un-merged events on restart.

use std::sync::{Condvar, Mutex};

use tracing::debug;

use crate::attribute::Attribute;
use crate::error::QueueError;

use super::cancel::CancelToken;
use super::pending::{wait_for_batch, Pending};
use super::traits::{AttributeQueue, QueuedAttribute};

fn lock_err(context: &'static str) -> QueueError {
    QueueError::Backend(format!("poisoned lock: {context}"))
}

/// Mutex-guarded ordered map with a condition variable for blocked readers.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<Pending>,
    available: Condvar,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// An empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Pending::new()),
            available: Condvar::new(),
        }
    }
}

impl AttributeQueue for MemoryQueue {
    fn insert(&self, attribute: Attribute) -> Result<u64, QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("memory queue insert"))?;
        if state.closed {
            return Err(QueueError::Closed);
        }
        let sequence = state.push(attribute);
        drop(state);
        self.available.notify_all();
        Ok(sequence)
    }

    fn read(&self, max: usize, cancel: &CancelToken) -> Result<Vec<QueuedAttribute>, QueueError> {
        let state = self.state.lock().map_err(|_| lock_err("memory queue read"))?;
        wait_for_batch(&self.available, state, max, cancel, |p| p)
    }

    fn ack(&self, entries: &[QueuedAttribute]) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("memory queue ack"))?;
        let removed = state.remove(entries.iter().map(|e| e.sequence));
        debug!(requested = entries.len(), removed = removed.len(), "memory queue ack");
        Ok(())
    }

    fn wake_readers(&self) {
        // Taking the lock orders this notify after any reader's token check.
        let _guard = self.state.lock();
        self.available.notify_all();
    }

    fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().map_err(|_| lock_err("memory queue pending"))?.len())
    }

    fn close(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| lock_err("memory queue close"))?;
        state.closed = true;
        drop(state);
        self.available.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::VertexId;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn attr(n: u64) -> Attribute {
        Attribute::new("k", format!("v{n}"), VertexId(n))
    }

    #[test]
    fn read_is_fifo_and_non_destructive() {
        let q = MemoryQueue::new();
        for n in 1..=5 {
            q.insert(attr(n)).unwrap();
        }
        let token = CancelToken::new();

        let first = q.read(5, &token).unwrap();
        let second = q.read(5, &token).unwrap();
        assert_eq!(first, second);
        let values: Vec<_> = first.iter().map(|e| e.attribute.vertex_id.0).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);

        q.ack(&first[..2]).unwrap();
        let rest = q.read(1000, &token).unwrap();
        assert_eq!(rest, first[2..].to_vec());
        assert_eq!(q.pending().unwrap(), 3);
    }

    #[test]
    fn ack_of_unknown_entries_is_noop() {
        let q = MemoryQueue::new();
        q.insert(attr(1)).unwrap();
        let token = CancelToken::new();
        let batch = q.read(1, &token).unwrap();

        q.ack(&batch).unwrap();
        q.ack(&batch).unwrap();
        assert_eq!(q.pending().unwrap(), 0);
    }

    #[test]
    fn blocked_read_released_by_insert() {
        let q = Arc::new(MemoryQueue::new());
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let start = Instant::now();
                let batch = q.read(1, &CancelToken::new()).unwrap();
                (batch, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        q.insert(attr(9)).unwrap();

        let (batch, elapsed) = reader.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attribute.vertex_id, VertexId(9));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn blocked_read_released_by_cancel() {
        let q = Arc::new(MemoryQueue::new());
        let token = CancelToken::new();
        let reader = {
            let q = Arc::clone(&q);
            let token = token.clone();
            thread::spawn(move || q.read(10, &token))
        };

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        q.wake_readers();

        assert_eq!(reader.join().unwrap(), Err(QueueError::Cancelled));
    }

    #[test]
    fn close_rejects_inserts_and_releases_readers() {
        let q = Arc::new(MemoryQueue::new());
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.read(10, &CancelToken::new()))
        };

        thread::sleep(Duration::from_millis(50));
        q.close().unwrap();
        q.close().unwrap();

        assert_eq!(reader.join().unwrap(), Err(QueueError::Closed));
        assert_eq!(q.insert(attr(1)), Err(QueueError::Closed));
    }

    #[test]
    fn zero_max_returns_immediately() {
        let q = MemoryQueue::new();
        assert!(q.read(0, &CancelToken::new()).unwrap().is_empty());
    }
}
