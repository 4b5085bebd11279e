//! Durable queue of candidate-duplicate events.
//!
//! One trait, two backends:
//! - [`MemoryQueue`]: process-lifetime durability, for tests and ephemeral use
//! - [`DiskQueue`]: crash-recoverable log in a directory (feature `persistent`)

mod cancel;
mod memory;
mod pending;
mod traits;

#[cfg(feature = "persistent")]
pub mod disk;

pub use cancel::CancelToken;
pub use memory::MemoryQueue;
pub use traits::{AttributeQueue, QueuedAttribute};

#[cfg(feature = "persistent")]
pub use disk::{DiskQueue, DiskQueueOptions};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DedupError};

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueBackend {
    /// [`MemoryQueue`]; records last as long as the process.
    Memory,
    /// `DiskQueue` rooted at `dir`.
    Disk {
        /// Directory holding the lock file and the log.
        dir: PathBuf,
    },
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backend to open.
    pub backend: QueueBackend,
    /// Whether the disk backend fsyncs after every frame.
    pub sync_on_write: bool,
    /// Disk log size that triggers compaction (bytes).
    pub max_log_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            sync_on_write: true,
            max_log_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl QueueConfig {
    const MIN_LOG_BYTES: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// A disk-backed configuration rooted at `dir`.
    #[must_use]
    pub fn disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: QueueBackend::Disk { dir: dir.into() },
            ..Self::default()
        }
    }

    /// Check field ranges, returning the config unchanged when valid.
    ///
    /// # Errors
    /// - `Invalid` naming the first out-of-range field
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_log_bytes < Self::MIN_LOG_BYTES {
            return Err(ConfigError::Invalid {
                field: "queue.max_log_bytes".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_LOG_BYTES,
                    self.max_log_bytes
                ),
            });
        }

        if let QueueBackend::Disk { dir } = &self.backend {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "queue.backend.dir".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }

        Ok(self)
    }
}

/// Open the backend selected by `config`.
///
/// # Errors
/// - `Config` if the configuration is invalid or names a backend this build
///   does not include
/// - `Queue` if the disk backend cannot be opened
pub fn open_queue(config: &QueueConfig) -> Result<Arc<dyn AttributeQueue>, DedupError> {
    let config = config.clone().validate()?;
    match config.backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new())),
        #[cfg(feature = "persistent")]
        QueueBackend::Disk { dir } => {
            let options = DiskQueueOptions {
                sync_on_write: config.sync_on_write,
                max_log_bytes: config.max_log_bytes,
            };
            Ok(Arc::new(DiskQueue::open(dir, options)?))
        }
        #[cfg(not(feature = "persistent"))]
        QueueBackend::Disk { .. } => Err(ConfigError::Invalid {
            field: "queue.backend".to_string(),
            reason: "disk backend requires the `persistent` feature".to_string(),
        }
        .into()),
    }
}
