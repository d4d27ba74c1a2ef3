//! Error types for the geofence engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::index::IndexError;

/// Result type for geofence operations.
pub type GeofenceResult<T> = Result<T, GeofenceError>;

/// Errors raised by monitors, the manager and their collaborators.
///
/// None of these abort a tick: the manager logs them and moves on. The
/// variant only decides what happens next (skip, drop, or retry next pass).
#[derive(Debug, Error)]
pub enum GeofenceError {
    /// Fence is missing or has tracking disabled. Logged, never retried.
    #[error("Invalid fence: {0}")]
    InvalidFence(String),

    /// No usable geometry backs the fence.
    #[error("Invalid shape {shape_id}: {reason}")]
    InvalidShape { shape_id: String, reason: String },

    /// The spatial index rejected a call. The item is skipped for this pass
    /// and naturally retried on the next one.
    #[error("Spatial index operation failed: {0}")]
    IndexOperation(#[from] IndexError),

    /// The shape a monitor relies on was deleted while the fence was active.
    #[error("Stale monitor {0}: shape no longer exists")]
    StaleMonitor(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence sink failure.
    #[error("Persistence error for {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GeofenceError {
    /// Shorthand for an [`GeofenceError::InvalidShape`] error.
    pub fn invalid_shape(shape_id: impl Into<String>, reason: impl Into<String>) -> Self {
        GeofenceError::InvalidShape {
            shape_id: shape_id.into(),
            reason: reason.into(),
        }
    }
}
