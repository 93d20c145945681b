//! Structured logging setup
//!
//! Installs a `tracing-subscriber` fmt subscriber from a [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.

use crate::config::LoggingConfig;
use crate::error::{MeshError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Build the env filter for `config`
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()))
}

/// Install the global subscriber described by `config`.
///
/// File output wins over console output when both are enabled. Calling this
/// twice returns a configuration error instead of panicking.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            MeshError::ConfigError("log_file_path must be set when log_to_file is true".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| MeshError::ConfigError(format!("Failed to open log file: {e}")))?;
        let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
        if config.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        }
    } else if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| MeshError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
