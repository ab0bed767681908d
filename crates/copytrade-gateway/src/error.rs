//! Error types for the gateway manager.

use thiserror::Error;

use crate::container::ContainerError;
use crate::follower::StoreError;
use crate::pool::ResourceKind;

/// Gateway manager error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No free value left in a resource pool.
    #[error("{resource} pool exhausted (range {range_start}..={range_end})")]
    ResourceExhausted {
        /// Which pool ran dry.
        resource: ResourceKind,
        /// First value of the pool range.
        range_start: u64,
        /// Last value of the pool range.
        range_end: u64,
    },

    /// A gateway is already registered for this follower.
    #[error("gateway already running for follower {0}")]
    AlreadyRunning(String),

    /// The desired-state store has no such follower.
    #[error("follower not found: {0}")]
    FollowerNotFound(String),

    /// The follower exists but is disabled or not active.
    #[error("follower {0} is not enabled and active")]
    FollowerNotEligible(String),

    /// No gateway is registered for this follower.
    #[error("no gateway registered for follower {0}")]
    GatewayNotFound(String),

    /// Credentials could not be resolved.
    #[error("credential resolution failed for follower {follower_id} after {attempts} attempt(s): {reason}")]
    CredentialResolutionFailed {
        /// Follower whose launch was abandoned.
        follower_id: String,
        /// Vault attempts made (0 when no lookup was possible).
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// Broker session could not be established within the retry ceiling.
    #[error("broker connection failed for follower {follower_id} after {attempts} attempt(s): {reason}")]
    ConnectionFailed {
        /// Follower whose session failed.
        follower_id: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// Container stop/remove failed even after forced removal.
    #[error("container teardown failed for follower {follower_id}: {reason}")]
    ContainerTeardownFailed {
        /// Follower whose container could not be cleaned up.
        follower_id: String,
        /// Last failure.
        reason: String,
    },

    /// Container runtime error.
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// Desired-state store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The manager is shutting down and accepts no new work.
    #[error("gateway manager is shutting down")]
    ShuttingDown,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for gateway manager operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
