//! Prelude module - commonly used types for convenient import.
//!
//! Use `use copytrade_telemetry::prelude::*;` to import the essentials.

// Errors
pub use crate::{TelemetryError, TelemetryResult};

// Logging configuration
pub use crate::{FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget};

// Setup functions
pub use crate::{setup_default_logging, setup_logging};
