//! Queue contract shared by every backend.

use serde::{Deserialize, Serialize};

use crate::attribute::Attribute;
use crate::error::QueueError;

use super::cancel::CancelToken;

/// A record as handed out by `read`: the attribute plus its queue sequence.
///
/// Acks are matched by sequence, so identical attributes inserted twice remain
/// two independent entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAttribute {
    /// Position assigned by `insert`; unique for the life of the queue.
    pub sequence: u64,
    /// The record as it was inserted.
    pub attribute: Attribute,
}

/// Durable, at-least-once queue of candidate-duplicate events.
///
/// # Contract
/// - `read` never removes records; only `ack` does
/// - `read` returns pending records in insertion (sequence) order
/// - `read` on an empty queue blocks until a record arrives, the token is
///   cancelled (and readers are woken), or the queue is closed
/// - acking a sequence that is not pending is a no-op
pub trait AttributeQueue: Send + Sync {
    /// Append a record. Returns its sequence once the write is durable.
    ///
    /// # Errors
    /// - `Closed` after `close`
    /// - `Io` if the record could not be persisted; the record is not queued
    fn insert(&self, attribute: Attribute) -> Result<u64, QueueError>;

    /// Return up to `max` pending records without removing them.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fired while waiting
    /// - `Closed` if the queue was closed
    fn read(&self, max: usize, cancel: &CancelToken) -> Result<Vec<QueuedAttribute>, QueueError>;

    /// Mark records consumed.
    ///
    /// # Errors
    /// - `Closed` after `close`
    /// - `Io` if the ack could not be persisted; the records stay pending
    fn ack(&self, entries: &[QueuedAttribute]) -> Result<(), QueueError>;

    /// Wake every blocked reader so it re-checks its token.
    fn wake_readers(&self);

    /// Number of records not yet acked.
    fn pending(&self) -> Result<usize, QueueError>;

    /// Close the queue and release its resources. Idempotent.
    fn close(&self) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_queue_object_safe(_: &dyn AttributeQueue) {}
}
