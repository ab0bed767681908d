//! Copytrade Gateway - Per-follower broker gateway fleet manager.
//!
//! Every follower account trades through its own broker gateway container.
//! This crate launches those containers, hands each one an exclusive host
//! port and broker client id, keeps a broker API session alive against it,
//! and tears it down again when the follower leaves the desired set.
//!
//! # Architecture
//!
//! ```text
//! GatewayManager (reconciliation, public operations)
//! ├── Fleet (follower → GatewayInstance map, port pool, client id pool)
//! ├── ContainerLauncher
//! │   └── CredentialResolver → VaultClient
//! ├── ConnectionSupervisor → BrokerConnector (retry via BackoffPolicy)
//! └── HealthMonitor (periodic concurrent sweeps)
//! ```
//!
//! The container runtime, broker API, credential vault and follower store
//! are traits; adapters for real systems plug in through [`Collaborators`].
//!
//! # Example
//!
//! ```rust,ignore
//! use copytrade_gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> GatewayResult<()> {
//!     let config = GatewayManagerConfig::load("gateway.toml")?;
//!     copytrade_telemetry::setup_logging(&config.logging).ok();
//!
//!     let store = Arc::new(StaticFollowerStore::new(config.followers.clone()));
//!     let manager = GatewayManager::new(config, Collaborators {
//!         store,
//!         vault: Some(vault),
//!         runtime: docker,
//!         broker: ib_connector,
//!     })?;
//!
//!     let report = manager.start().await?;
//!     println!("launched {} gateways", report.started.len());
//!
//!     if let Some(client) = manager.get_client("follower-1").await {
//!         println!("accounts: {:?}", client.managed_accounts());
//!     }
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod backoff;
pub mod broker;
pub mod config;
pub mod container;
pub mod credentials;
pub mod error;
pub mod events;
pub mod fleet;
pub mod follower;
pub mod health;
pub mod instance;
pub mod launcher;
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod supervisor;
pub mod vault;

pub use backoff::{BackoffPolicy, RetryOutcome, retry, retry_with_cancel};
pub use broker::{BrokerClient, BrokerConnector, BrokerEndpoint, BrokerError};
pub use config::{GatewayManagerConfig, GatewaySettings, PoolConfig, RetryConfig, TimeoutConfig};
pub use container::{
    ContainerError, ContainerHandle, ContainerLookup, ContainerRuntime, ContainerSpec,
    ContainerStatus,
};
pub use credentials::CredentialResolver;
pub use error::{GatewayError, GatewayResult};
pub use events::{EventSink, GatewayEvent};
pub use fleet::{Fleet, PoolUsage, Reservation};
pub use follower::{Follower, FollowerState, FollowerStore, StaticFollowerStore, StoreError};
pub use health::{HealthCheck, HealthState, HealthStatus};
pub use instance::{GatewayInstance, GatewayStatus, GatewaySummary};
pub use launcher::ContainerLauncher;
pub use manager::{Collaborators, GatewayManager, ReconcileReport};
pub use monitor::{HealthMonitor, SweepSummary};
pub use pool::{ClientIdPool, PortPool, ResourceKind, ResourcePool};
pub use supervisor::{ConnectionSupervisor, FailureKind};
pub use vault::{Credentials, VaultClient, VaultError};
