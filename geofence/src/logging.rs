//! Tracing subscriber setup.
//!
//! Console output always goes to stderr. When a log directory is configured
//! a daily rolling file is written through a non-blocking appender; keep the
//! returned [`LoggingGuard`] alive until exit so buffered lines are flushed.

use std::io;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "geofence.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to create log directory: {0}")]
    Directory(#[from] io::Error),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Flushes the file appender on drop.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    file: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn writes_file(&self) -> bool {
        self.file.is_some()
    }
}

/// Build the filter: `RUST_LOG` when set, otherwise the configured directive.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| LoggingError::InvalidFilter {
        filter: config.filter.clone(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let filter = build_filter(config)?;

    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(false);

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard { file: guard })
}
