//! Copytrade Telemetry - Logging setup for the gateway fleet.
//!
//! Wraps `tracing-subscriber` so every binary and test harness in the
//! workspace configures logging the same way: a level, optional per-target
//! directives, an output format and an output target (stdout, stderr or a
//! rolling file).
//!
//! # Example
//!
//! ```rust,no_run
//! use copytrade_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), copytrade_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("copytrade_gateway=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!(follower_id = "f-1", "gateway launched");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
