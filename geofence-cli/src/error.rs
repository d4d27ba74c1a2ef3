//! CLI error type.

use std::fmt;
use std::path::PathBuf;

use geofence::config::ConfigError;
use geofence::logging::LoggingError;
use geofence::service::ServiceError;
use geofence::GeofenceError;

#[derive(Debug)]
pub enum CliError {
    Config(String),
    Scenario { path: PathBuf, reason: String },
    Logging(LoggingError),
    Engine(GeofenceError),
    Service(ServiceError),
    Runtime(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Scenario { path, reason } => {
                write!(f, "Invalid scenario {}: {}", path.display(), reason)
            }
            CliError::Logging(e) => write!(f, "Logging error: {}", e),
            CliError::Engine(e) => write!(f, "{}", e),
            CliError::Service(e) => write!(f, "Service error: {}", e),
            CliError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<GeofenceError> for CliError {
    fn from(e: GeofenceError) -> Self {
        CliError::Engine(e)
    }
}

impl From<ServiceError> for CliError {
    fn from(e: ServiceError) -> Self {
        CliError::Service(e)
    }
}
