//! Tracing subscriber setup for binaries and tests embedding the daemon.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::ConfigError;

/// Install a global fmt subscriber filtered by `filter` (e.g. `"info"` or
/// `"attrdedup=debug"`).
///
/// # Errors
/// - `Invalid` if `filter` does not parse or a subscriber is already installed
pub fn init_logging(filter: &str) -> Result<(), ConfigError> {
    fmt()
        .with_env_filter(EnvFilter::try_new(filter).map_err(|e| ConfigError::Invalid {
            field: "log_filter".to_string(),
            reason: format!("invalid filter: {e}"),
        })?)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|_| ConfigError::Invalid {
            field: "log_filter".to_string(),
            reason: "logging already initialized".to_string(),
        })
}
