//! Pending-record bookkeeping shared by the queue backends.

use std::collections::BTreeMap;
use std::sync::{Condvar, MutexGuard};

use crate::attribute::Attribute;
use crate::error::QueueError;

use super::cancel::CancelToken;
use super::traits::QueuedAttribute;

/// Un-acked records keyed by sequence, plus the next sequence to hand out.
#[derive(Debug)]
pub(crate) struct Pending {
    entries: BTreeMap<u64, Attribute>,
    next_sequence: u64,
    pub(crate) closed: bool,
}

impl Pending {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 1,
            closed: false,
        }
    }

    /// Sequence the next push will receive.
    pub(crate) fn peek_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn push(&mut self, attribute: Attribute) -> u64 {
        let sequence = self.next_sequence;
        self.restore(sequence, attribute);
        sequence
    }

    /// Re-insert a record under a known sequence (log replay).
    pub(crate) fn restore(&mut self, sequence: u64, attribute: Attribute) {
        self.entries.insert(sequence, attribute);
        self.next_sequence = self.next_sequence.max(sequence + 1);
    }

    /// Never hand out a sequence below `next_sequence`.
    pub(crate) fn advance_to(&mut self, next_sequence: u64) {
        self.next_sequence = self.next_sequence.max(next_sequence);
    }

    /// Drop sequences; returns the ones that were actually pending.
    pub(crate) fn remove(&mut self, sequences: impl IntoIterator<Item = u64>) -> Vec<u64> {
        sequences
            .into_iter()
            .filter(|seq| self.entries.remove(seq).is_some())
            .collect()
    }

    /// Only the pending subset of `entries`, in input order.
    pub(crate) fn pending_of(&self, entries: &[QueuedAttribute]) -> Vec<u64> {
        entries
            .iter()
            .map(|e| e.sequence)
            .filter(|seq| self.entries.contains_key(seq))
            .collect()
    }

    pub(crate) fn batch(&self, max: usize) -> Vec<QueuedAttribute> {
        self.entries
            .iter()
            .take(max)
            .map(|(&sequence, attribute)| QueuedAttribute {
                sequence,
                attribute: attribute.clone(),
            })
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&u64, &Attribute)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Block on `available` until `pending(state)` has records, then return up to
/// `max` of them.
///
/// The token and the closed flag are checked while holding the lock, so a
/// cancellation followed by `notify_all` under the same lock is never missed.
pub(crate) fn wait_for_batch<S>(
    available: &Condvar,
    mut guard: MutexGuard<'_, S>,
    max: usize,
    cancel: &CancelToken,
    pending: impl Fn(&S) -> &Pending,
) -> Result<Vec<QueuedAttribute>, QueueError> {
    loop {
        let state = pending(&*guard);
        if state.closed {
            return Err(QueueError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        if max == 0 {
            return Ok(Vec::new());
        }
        if !state.is_empty() {
            return Ok(state.batch(max));
        }
        guard = available
            .wait(guard)
            .map_err(|_| QueueError::Backend("poisoned lock: queue wait".to_string()))?;
    }
}
