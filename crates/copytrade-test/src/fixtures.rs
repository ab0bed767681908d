//! Test fixtures for common types.

use std::collections::BTreeMap;

use copytrade_gateway::launcher::{CLIENT_ID_LABEL, FOLLOWER_LABEL, HOST_PORT_LABEL, MANAGED_LABEL};
use copytrade_gateway::{BackoffPolicy, Credentials, Follower, GatewayManagerConfig};

/// Create an enabled follower with an inline username.
#[must_use]
pub fn follower(id: &str) -> Follower {
    Follower::new(id).with_username(format!("user-{id}"))
}

/// Create an enabled follower whose credentials live in the vault under
/// `secret/<id>`.
#[must_use]
pub fn vault_follower(id: &str) -> Follower {
    Follower::new(id).with_vault_ref(vault_ref(id))
}

/// Vault reference used by [`vault_follower`].
#[must_use]
pub fn vault_ref(id: &str) -> String {
    format!("secret/{id}")
}

/// Credentials stored for [`vault_follower`] in tests.
#[must_use]
pub fn test_credentials(id: &str) -> Credentials {
    Credentials::new(format!("user-{id}"), format!("pw-{id}"))
}

/// Labels the launcher puts on a gateway container bound to `host_port`
/// and `client_id`.
#[must_use]
pub fn gateway_labels(follower_id: &str, host_port: u16, client_id: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (FOLLOWER_LABEL.to_string(), follower_id.to_string()),
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (HOST_PORT_LABEL.to_string(), host_port.to_string()),
        (CLIENT_ID_LABEL.to_string(), client_id.to_string()),
    ])
}

/// A retry policy with millisecond delays.
#[must_use]
pub fn fast_policy(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_attempts,
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 5,
        jitter: 0.0,
    }
}

/// Configuration tuned for tests.
///
/// Ten ports (4100..=4109) and ten client ids (1..=10), millisecond retry
/// delays, a long health interval so only explicit sweeps run, and
/// `connect_on_launch` off so attempt counts are deterministic.
#[must_use]
pub fn test_config() -> GatewayManagerConfig {
    let mut config = GatewayManagerConfig::default();
    config.gateway.connect_on_launch = false;
    config.pools.port_start = 4100;
    config.pools.port_end = 4109;
    config.pools.client_id_start = 1;
    config.pools.client_id_end = 10;
    config.timeouts.healthcheck_interval_secs = 3600;
    config.timeouts.max_startup_secs = 60;
    config.timeouts.connect_timeout_secs = 1;
    config.timeouts.container_timeout_secs = 1;
    config.timeouts.stop_timeout_secs = 1;
    config.timeouts.shutdown_timeout_secs = 2;
    config.retry.connect = fast_policy(3);
    config.retry.vault = fast_policy(3);
    config
}
