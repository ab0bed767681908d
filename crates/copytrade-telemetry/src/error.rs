//! Telemetry error types.

use thiserror::Error;

/// Errors raised while configuring logging.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log configuration is invalid (bad level or directive).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A global subscriber could not be installed.
    #[error("initialization error: {0}")]
    InitError(String),

    /// IO error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
