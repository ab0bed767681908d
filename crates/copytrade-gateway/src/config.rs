//! Gateway manager configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use copytrade_telemetry::LogConfig;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{GatewayError, GatewayResult};
use crate::follower::Follower;

/// Gateway manager configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayManagerConfig {
    /// Container image and broker settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Port and client id ranges.
    #[serde(default)]
    pub pools: PoolConfig,

    /// Intervals and timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry policies.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LogConfig,

    /// Static desired state for the in-memory follower store.
    #[serde(default)]
    pub followers: Vec<Follower>,
}

/// Settings for the gateway containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Container image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Prefix for container names; the sanitised follower id is appended.
    #[serde(default = "default_container_name_prefix")]
    pub container_name_prefix: String,

    /// Port the broker API listens on inside the container.
    #[serde(default = "default_container_api_port")]
    pub container_api_port: u16,

    /// Host the published ports are reachable on.
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    /// `paper` or `live`.
    #[serde(default = "default_trading_mode")]
    pub trading_mode: String,

    /// Run one health check right after each launch instead of waiting for
    /// the next sweep.
    #[serde(default = "default_true")]
    pub connect_on_launch: bool,

    /// Extra environment variables for every container.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name_prefix: default_container_name_prefix(),
            container_api_port: default_container_api_port(),
            broker_host: default_broker_host(),
            trading_mode: default_trading_mode(),
            connect_on_launch: true,
            extra_env: BTreeMap::new(),
        }
    }
}

fn default_image() -> String {
    "ghcr.io/gnzsnz/ib-gateway:stable".to_string()
}

fn default_container_name_prefix() -> String {
    "ibgw-".to_string()
}

fn default_container_api_port() -> u16 {
    4004
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_trading_mode() -> String {
    "paper".to_string()
}

fn default_true() -> bool {
    true
}

/// Inclusive resource ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// First host port.
    #[serde(default = "default_port_start")]
    pub port_start: u16,
    /// Last host port.
    #[serde(default = "default_port_end")]
    pub port_end: u16,
    /// First broker client id.
    #[serde(default = "default_client_id_start")]
    pub client_id_start: u32,
    /// Last broker client id.
    #[serde(default = "default_client_id_end")]
    pub client_id_end: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_start: default_port_start(),
            port_end: default_port_end(),
            client_id_start: default_client_id_start(),
            client_id_end: default_client_id_end(),
        }
    }
}

fn default_port_start() -> u16 {
    4100
}

fn default_port_end() -> u16 {
    4199
}

fn default_client_id_start() -> u32 {
    1
}

fn default_client_id_end() -> u32 {
    999
}

/// Intervals and timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds between health sweeps.
    #[serde(default = "default_healthcheck_interval")]
    pub healthcheck_interval_secs: u64,
    /// Grace period for a new container to reach running.
    #[serde(default = "default_max_startup")]
    pub max_startup_secs: u64,
    /// Per-attempt broker connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on container runtime calls during health checks and launches.
    #[serde(default = "default_container_timeout")]
    pub container_timeout_secs: u64,
    /// Graceful container stop timeout.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// How long `stop()` waits for the monitor before aborting it.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Sub-second override for the sweep interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck_interval_ms: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            healthcheck_interval_secs: default_healthcheck_interval(),
            max_startup_secs: default_max_startup(),
            connect_timeout_secs: default_connect_timeout(),
            container_timeout_secs: default_container_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            healthcheck_interval_ms: None,
        }
    }
}

fn default_healthcheck_interval() -> u64 {
    30
}

fn default_max_startup() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_container_timeout() -> u64 {
    15
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Retry policies per collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Broker connect retries.
    #[serde(default)]
    pub connect: BackoffPolicy,
    /// Vault lookup retries.
    #[serde(default = "default_vault_policy")]
    pub vault: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect: BackoffPolicy::default(),
            vault: default_vault_policy(),
        }
    }
}

fn default_vault_policy() -> BackoffPolicy {
    BackoffPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5), 2.0)
}

impl GatewayManagerConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_or_default(path: impl AsRef<Path>) -> GatewayResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> GatewayResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges, intervals, and retry ceilings.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] describing the first problem found.
    pub fn validate(&self) -> GatewayResult<()> {
        let pools = &self.pools;
        if pools.port_start > pools.port_end {
            return Err(GatewayError::Config(format!(
                "pools.port_start ({}) is after pools.port_end ({})",
                pools.port_start, pools.port_end
            )));
        }
        if pools.port_start == 0 {
            return Err(GatewayError::Config("pools.port_start must be non-zero".into()));
        }
        if pools.client_id_start > pools.client_id_end {
            return Err(GatewayError::Config(format!(
                "pools.client_id_start ({}) is after pools.client_id_end ({})",
                pools.client_id_start, pools.client_id_end
            )));
        }
        if i32::try_from(pools.client_id_end).is_err() {
            return Err(GatewayError::Config(format!(
                "pools.client_id_end ({}) exceeds the broker's signed 32-bit client id",
                pools.client_id_end
            )));
        }

        if self.healthcheck_interval().is_zero() {
            return Err(GatewayError::Config(
                "timeouts.healthcheck_interval must be non-zero".into(),
            ));
        }
        if self.timeouts.connect_timeout_secs == 0 {
            return Err(GatewayError::Config(
                "timeouts.connect_timeout_secs must be non-zero".into(),
            ));
        }

        for (name, policy) in [("connect", &self.retry.connect), ("vault", &self.retry.vault)] {
            if policy.max_attempts == 0 {
                return Err(GatewayError::Config(format!(
                    "retry.{name}.max_attempts must be at least 1"
                )));
            }
            if !(0.0..=1.0).contains(&policy.jitter) {
                return Err(GatewayError::Config(format!(
                    "retry.{name}.jitter must be within 0.0..=1.0"
                )));
            }
        }

        if self.gateway.image.trim().is_empty() {
            return Err(GatewayError::Config("gateway.image must be set".into()));
        }
        Ok(())
    }

    /// Sweep interval.
    #[must_use]
    pub fn healthcheck_interval(&self) -> Duration {
        match self.timeouts.healthcheck_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.timeouts.healthcheck_interval_secs),
        }
    }

    /// Startup grace period.
    #[must_use]
    pub fn max_startup_time(&self) -> Duration {
        Duration::from_secs(self.timeouts.max_startup_secs)
    }

    /// Per-attempt connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_timeout_secs)
    }

    /// Container runtime call timeout.
    #[must_use]
    pub fn container_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.container_timeout_secs)
    }

    /// Graceful stop timeout.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stop_timeout_secs)
    }

    /// Monitor shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_timeout_secs)
    }
}
