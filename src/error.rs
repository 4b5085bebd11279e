//! Error types for attribute deduplication.
//!
//! All errors are strongly typed using thiserror, one enum per layer.
//! Errors carry rendered messages rather than source errors so they can be
//! cloned into the daemon's exit outcome and observed from several handles.

use thiserror::Error;

use crate::attribute::VertexId;

/// Errors raised by the durable queue backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A blocked `read` was released by its cancellation token.
    #[error("Queue read cancelled")]
    Cancelled,

    /// The queue has been closed.
    #[error("Queue is closed")]
    Closed,

    /// An I/O failure; the operation was not made durable.
    #[error("Queue I/O error: {0}")]
    Io(String),

    /// A complete log frame failed checksum or decoding.
    #[error("Queue log corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the queue directory.
    #[error("Queue directory locked: {0}")]
    Locked(String),

    /// Backend invariant failure (poisoned lock and similar).
    #[error("Queue backend error: {0}")]
    Backend(String),
}

// Lock contention and corruption are classified where they are detected;
// a bare I/O error is always `Io`.
impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised by the graph store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The keyspace does not exist.
    #[error("Keyspace not found: {0}")]
    KeyspaceNotFound(String),

    /// The vertex never existed in this transaction's view.
    #[error("Vertex not found: {0}")]
    VertexNotFound(VertexId),

    /// The vertex existed but was removed before it could be used.
    #[error("Vertex already removed: {0}")]
    VertexRemoved(VertexId),

    /// The edge does not exist.
    #[error("Edge not found: {0}")]
    EdgeNotFound(u64),

    /// Optimistic write conflict detected at commit.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The store is temporarily unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("Invalid configuration for '{field}': {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// What the field must satisfy.
        reason: String,
    },

    /// The configuration text is not valid JSON for the expected shape.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(String),
}

/// Top-level error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupError {
    /// The queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The graph store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The configuration was rejected.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Every attempt of a retried operation failed.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<DedupError>,
    },

    /// Invariant failure inside the crate (poisoned lock, spawn failure).
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl DedupError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if a fresh attempt of the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Conflict(_) | StoreError::Unavailable(_))
        )
    }

    /// Returns true if this error signals an orderly shutdown of a reader.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Queue(QueueError::Cancelled | QueueError::Closed))
    }
}

/// Result type alias for deduplication operations.
pub type DedupResult<T> = Result<T, DedupError>;
