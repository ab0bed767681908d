//! Prelude module - commonly used types for convenient import.
//!
//! Use `use copytrade_gateway::prelude::*;` to import all essential types.

// Errors
pub use crate::{GatewayError, GatewayResult};

// Configuration
pub use crate::{GatewayManagerConfig, GatewaySettings, PoolConfig, RetryConfig, TimeoutConfig};

// Manager
pub use crate::{Collaborators, GatewayManager, ReconcileReport};

// Gateway state
pub use crate::{GatewayStatus, GatewaySummary, PoolUsage};

// Collaborator interfaces
pub use crate::{
    BrokerClient, BrokerConnector, ContainerHandle, ContainerRuntime, FollowerStore, VaultClient,
};

// Desired state
pub use crate::{Follower, FollowerState, StaticFollowerStore};

// Health and events
pub use crate::{GatewayEvent, HealthCheck, HealthState, HealthStatus};

// Retry
pub use crate::BackoffPolicy;
