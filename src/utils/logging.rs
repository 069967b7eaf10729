//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` fmt subscriber from [`LoggingConfig`]. `RUST_LOG`, when
//! set, takes precedence over the configured level. Installing twice is harmless: the
//! second call reports that a subscriber already exists.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber.
///
/// Returns `Ok(false)` if another subscriber was installed first.
///
/// # Errors
/// Returns `ConfigError` when the log file cannot be opened
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match (config.log_to_file, config.json_format) {
        (true, json) => {
            let path = config.log_file_path.as_deref().ok_or_else(|| {
                ProtocolError::ConfigError("log_file_path must be set for file logging".into())
            })?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
            let writer = Arc::new(file);
            if json {
                builder.json().with_writer(writer).try_init().is_ok()
            } else {
                builder.with_ansi(false).with_writer(writer).try_init().is_ok()
            }
        }
        (false, true) => builder.json().try_init().is_ok(),
        (false, false) => builder.try_init().is_ok(),
    };

    if installed {
        debug!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}
