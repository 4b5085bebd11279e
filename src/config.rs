//! Top-level configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "queue":  { "backend": { "type": "disk", "dir": "/var/lib/dedup" } },
//!   "daemon": { "batch_size": 500, "ack_policy": "requeue_failed",
//!               "retry": { "max_attempts": 3, "initial_delay": 20 } }
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::daemon::DaemonConfig;
use crate::error::ConfigError;
use crate::queue::QueueConfig;

/// Queue and daemon settings together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Queue backend and its tuning.
    pub queue: QueueConfig,
    /// Worker loop settings.
    pub daemon: DaemonConfig,
}

impl DedupConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// - `Parse` on malformed JSON or unknown enum variants
    /// - `Invalid` if a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - see [`from_json_str`](Self::from_json_str)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Validate both sections.
    ///
    /// # Errors
    /// - `Invalid` naming the first out-of-range field
    pub fn validate(self) -> Result<Self, ConfigError> {
        Ok(Self {
            queue: self.queue.validate()?,
            daemon: self.daemon.validate()?,
        })
    }
}
