//! Test harness wiring mocks into a gateway manager.

use std::sync::Arc;

use copytrade_gateway::{
    Collaborators, Follower, GatewayManager, GatewayManagerConfig, StaticFollowerStore,
};
use tracing_subscriber::EnvFilter;

use crate::mocks::{MockBrokerConnector, MockContainerRuntime, MockVault};

/// Set up test logging with the given filter.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// Set up test logging from `RUST_LOG`, defaulting to `warn`.
pub fn init_test_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    setup_test_logging(&filter);
}

/// A manager plus handles to every mock behind it.
pub struct TestHarness {
    /// Manager under test.
    pub manager: Arc<GatewayManager>,
    /// Desired state.
    pub store: Arc<StaticFollowerStore>,
    /// Container runtime.
    pub runtime: MockContainerRuntime,
    /// Broker connector.
    pub broker: MockBrokerConnector,
    /// Credential vault.
    pub vault: MockVault,
}

impl TestHarness {
    /// Build a harness with default mocks.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn new(config: GatewayManagerConfig, followers: impl IntoIterator<Item = Follower>) -> Self {
        Self::with_mocks(
            config,
            followers,
            MockContainerRuntime::new(),
            MockBrokerConnector::new(),
            MockVault::new(),
        )
    }

    /// Build a harness around pre-configured mocks.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn with_mocks(
        config: GatewayManagerConfig,
        followers: impl IntoIterator<Item = Follower>,
        runtime: MockContainerRuntime,
        broker: MockBrokerConnector,
        vault: MockVault,
    ) -> Self {
        init_test_logging();
        let store = Arc::new(StaticFollowerStore::new(followers));
        let manager = GatewayManager::new(
            config,
            Collaborators {
                store: Arc::clone(&store) as _,
                vault: Some(Arc::new(vault.clone())),
                runtime: Arc::new(runtime.clone()),
                broker: Arc::new(broker.clone()),
            },
        )
        .expect("valid test configuration");

        Self {
            manager: Arc::new(manager),
            store,
            runtime,
            broker,
            vault,
        }
    }

    /// Container name the manager uses for `follower_id`.
    #[must_use]
    pub fn container_name(&self, follower_id: &str) -> String {
        format!(
            "{}{}",
            self.manager.config().gateway.container_name_prefix,
            copytrade_gateway::container::sanitize_name(follower_id)
        )
    }
}
