//! Mock collaborators for testing.
//!
//! All mocks are cheap to clone and share state between clones, so a test can
//! hand one clone to the manager and keep another for fault injection and
//! assertions. Internal state uses `std::sync::Mutex` so builder methods work
//! without a runtime.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use copytrade_gateway::{
    BrokerClient, BrokerConnector, BrokerEndpoint, BrokerError, ContainerError, ContainerHandle,
    ContainerLookup, ContainerRuntime, ContainerSpec, ContainerStatus, Credentials, VaultClient,
    VaultError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

/// A fake container.
#[derive(Debug)]
pub struct MockContainerHandle {
    id: String,
    name: String,
    spec: Option<ContainerSpec>,
    labels: BTreeMap<String, String>,
    status: Mutex<ContainerStatus>,
    removed: AtomicBool,
    stop_error: Mutex<Option<String>>,
    remove_error: Mutex<Option<String>>,
    force_remove_error: Mutex<Option<String>>,
    reload_delay: Mutex<Option<Duration>>,
    stops: AtomicU32,
    removals: AtomicU32,
    forced_removals: AtomicU32,
}

impl MockContainerHandle {
    fn new(
        id: String,
        name: String,
        spec: Option<ContainerSpec>,
        labels: BTreeMap<String, String>,
        status: ContainerStatus,
    ) -> Self {
        Self {
            id,
            name,
            spec,
            labels,
            status: Mutex::new(status),
            removed: AtomicBool::new(false),
            stop_error: Mutex::new(None),
            remove_error: Mutex::new(None),
            force_remove_error: Mutex::new(None),
            reload_delay: Mutex::new(None),
            stops: AtomicU32::new(0),
            removals: AtomicU32::new(0),
            forced_removals: AtomicU32::new(0),
        }
    }

    /// Spec the container was created from; `None` for pre-existing containers.
    #[must_use]
    pub fn spec(&self) -> Option<&ContainerSpec> {
        self.spec.as_ref()
    }

    /// Change what the runtime reports for this container.
    pub fn set_status(&self, status: ContainerStatus) {
        *lock(&self.status) = status;
    }

    /// Make graceful `stop` fail.
    pub fn fail_stop(&self, message: impl Into<String>) {
        *lock(&self.stop_error) = Some(message.into());
    }

    /// Make non-forced `remove` fail.
    pub fn fail_remove(&self, message: impl Into<String>) {
        *lock(&self.remove_error) = Some(message.into());
    }

    /// Make forced `remove` fail.
    pub fn fail_forced_remove(&self, message: impl Into<String>) {
        *lock(&self.force_remove_error) = Some(message.into());
    }

    /// Make `reload` hang for `delay`.
    pub fn delay_reload(&self, delay: Duration) {
        *lock(&self.reload_delay) = Some(delay);
    }

    /// Whether the container has been removed.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    #[must_use]
    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of non-forced `remove` calls.
    #[must_use]
    pub fn remove_count(&self) -> u32 {
        self.removals.load(Ordering::SeqCst)
    }

    /// Number of forced `remove` calls.
    #[must_use]
    pub fn forced_remove_count(&self) -> u32 {
        self.forced_removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerHandle for MockContainerHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn status(&self) -> ContainerStatus {
        *lock(&self.status)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }

    async fn reload(&self) -> Result<ContainerStatus, ContainerError> {
        let delay = *lock(&self.reload_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_removed() {
            return Err(ContainerError::Gone(self.name.clone()));
        }
        Ok(self.status())
    }

    async fn stop(&self, _timeout: Duration) -> Result<(), ContainerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.stop_error).clone() {
            return Err(ContainerError::Runtime(message));
        }
        self.set_status(ContainerStatus::Exited);
        Ok(())
    }

    async fn remove(&self, force: bool) -> Result<(), ContainerError> {
        let error = if force {
            self.forced_removals.fetch_add(1, Ordering::SeqCst);
            lock(&self.force_remove_error).clone()
        } else {
            self.removals.fetch_add(1, Ordering::SeqCst);
            lock(&self.remove_error).clone()
        };
        if let Some(message) = error {
            return Err(ContainerError::Runtime(message));
        }
        self.removed.store(true, Ordering::SeqCst);
        self.set_status(ContainerStatus::Dead);
        Ok(())
    }
}

#[derive(Debug)]
struct RuntimeState {
    containers: Mutex<HashMap<String, Arc<MockContainerHandle>>>,
    run_errors: Mutex<HashMap<String, String>>,
    initial_status: Mutex<ContainerStatus>,
    next_id: AtomicU32,
    runs: AtomicU32,
    lookups: AtomicU32,
}

/// In-memory container runtime.
#[derive(Debug, Clone)]
pub struct MockContainerRuntime {
    state: Arc<RuntimeState>,
}

impl Default for MockContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerRuntime {
    /// Create a runtime whose new containers start out running.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RuntimeState {
                containers: Mutex::new(HashMap::new()),
                run_errors: Mutex::new(HashMap::new()),
                initial_status: Mutex::new(ContainerStatus::Running),
                next_id: AtomicU32::new(1),
                runs: AtomicU32::new(0),
                lookups: AtomicU32::new(0),
            }),
        }
    }

    /// Status newly created containers report.
    #[must_use]
    pub fn with_initial_status(self, status: ContainerStatus) -> Self {
        *lock(&self.state.initial_status) = status;
        self
    }

    /// Make `run` fail for the container called `name`.
    #[must_use]
    pub fn with_run_failure(self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.fail_run(name, message);
        self
    }

    /// Make `run` fail for the container called `name` until cleared.
    pub fn fail_run(&self, name: impl Into<String>, message: impl Into<String>) {
        lock(&self.state.run_errors).insert(name.into(), message.into());
    }

    /// Clear an injected `run` failure.
    pub fn clear_run_failure(&self, name: &str) {
        lock(&self.state.run_errors).remove(name);
    }

    /// Register an unlabelled container that exists before the manager
    /// looks for it.
    pub fn insert_existing(&self, name: impl Into<String>, status: ContainerStatus) -> Arc<MockContainerHandle> {
        self.insert_existing_with_labels(name, BTreeMap::new(), status)
    }

    /// Register a pre-existing container carrying `labels`.
    pub fn insert_existing_with_labels(
        &self,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        status: ContainerStatus,
    ) -> Arc<MockContainerHandle> {
        let name = name.into();
        let handle = Arc::new(MockContainerHandle::new(
            self.allocate_id(),
            name.clone(),
            None,
            labels,
            status,
        ));
        lock(&self.state.containers).insert(name, Arc::clone(&handle));
        handle
    }

    /// Container by name, removed or not.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<Arc<MockContainerHandle>> {
        lock(&self.state.containers).get(name).cloned()
    }

    /// Change the status of a container. Returns `false` if unknown.
    pub fn set_status(&self, name: &str, status: ContainerStatus) -> bool {
        match self.container(name) {
            Some(handle) => {
                handle.set_status(status);
                true
            },
            None => false,
        }
    }

    /// Names of containers not yet removed, sorted.
    #[must_use]
    pub fn live_containers(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state.containers)
            .iter()
            .filter(|(_, handle)| !handle.is_removed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of `run` calls, failed ones included.
    #[must_use]
    pub fn run_count(&self) -> u32 {
        self.state.runs.load(Ordering::SeqCst)
    }

    /// Number of `get` calls.
    #[must_use]
    pub fn lookup_count(&self) -> u32 {
        self.state.lookups.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> String {
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        format!("mock-{n:04}")
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    async fn run(&self, spec: &ContainerSpec) -> Result<Arc<dyn ContainerHandle>, ContainerError> {
        self.state.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.state.run_errors).get(&spec.name).cloned() {
            return Err(ContainerError::Runtime(message));
        }

        let status = *lock(&self.state.initial_status);
        let handle = Arc::new(MockContainerHandle::new(
            self.allocate_id(),
            spec.name.clone(),
            Some(spec.clone()),
            spec.labels.clone(),
            status,
        ));
        lock(&self.state.containers).insert(spec.name.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    async fn get(&self, name: &str) -> Result<ContainerLookup, ContainerError> {
        self.state.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(match self.container(name) {
            Some(handle) if !handle.is_removed() => ContainerLookup::Found(handle),
            _ => ContainerLookup::NotFound,
        })
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A fake broker session.
#[derive(Debug)]
pub struct MockBrokerClient {
    endpoint: BrokerEndpoint,
    connected: AtomicBool,
    disconnect_fails: bool,
    disconnects: AtomicU32,
    accounts: Vec<String>,
}

impl MockBrokerClient {
    /// Endpoint the session was opened against.
    #[must_use]
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Simulate the session dropping.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.disconnect_fails {
            return Err(BrokerError::Other("socket already closed".into()));
        }
        Ok(())
    }

    fn managed_accounts(&self) -> Vec<String> {
        self.accounts.clone()
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    scripted: Mutex<VecDeque<BrokerError>>,
    refuse_all: AtomicBool,
    refused_ports: Mutex<Vec<u16>>,
    delay: Mutex<Option<Duration>>,
    disconnect_fails: AtomicBool,
    dead_on_arrival: AtomicBool,
    attempts: AtomicU32,
    attempts_by_port: Mutex<HashMap<u16, u32>>,
    clients: Mutex<Vec<Arc<MockBrokerClient>>>,
}

/// Broker connector with scripted failures.
///
/// Failure sources are checked in order: refuse-all, refused port, then the
/// scripted queue (one error consumed per attempt).
#[derive(Debug, Clone, Default)]
pub struct MockBrokerConnector {
    state: Arc<ConnectorState>,
}

impl MockBrokerConnector {
    /// Create a connector that accepts every attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` attempts with `Refused`.
    #[must_use]
    pub fn with_failures(self, n: u32) -> Self {
        for _ in 0..n {
            self.fail_next(BrokerError::Refused("mock".into()));
        }
        self
    }

    /// Delay every attempt by `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.state.delay) = Some(delay);
        self
    }

    /// Make sessions fail on `disconnect`.
    #[must_use]
    pub fn with_failing_disconnect(self) -> Self {
        self.state.disconnect_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Queue an error for the next unscripted attempt.
    pub fn fail_next(&self, error: BrokerError) {
        lock(&self.state.scripted).push_back(error);
    }

    /// Hand out sessions that are already disconnected while set.
    pub fn set_dead_on_arrival(&self, dead: bool) {
        self.state.dead_on_arrival.store(dead, Ordering::SeqCst);
    }

    /// Refuse every attempt while set.
    pub fn set_refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Refuse attempts against `port` while set.
    pub fn set_port_refused(&self, port: u16, refused: bool) {
        let mut ports = lock(&self.state.refused_ports);
        ports.retain(|p| *p != port);
        if refused {
            ports.push(port);
        }
    }

    /// Total attempts.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Attempts against `port`.
    #[must_use]
    pub fn attempts_for(&self, port: u16) -> u32 {
        lock(&self.state.attempts_by_port)
            .get(&port)
            .copied()
            .unwrap_or_default()
    }

    /// Reset attempt counters.
    pub fn reset_attempts(&self) {
        self.state.attempts.store(0, Ordering::SeqCst);
        lock(&self.state.attempts_by_port).clear();
    }

    /// Every session handed out, oldest first.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<MockBrokerClient>> {
        lock(&self.state.clients).clone()
    }

    /// Most recent session opened against `port`.
    #[must_use]
    pub fn latest_client(&self, port: u16) -> Option<Arc<MockBrokerClient>> {
        lock(&self.state.clients)
            .iter()
            .rev()
            .find(|c| c.endpoint.port == port)
            .cloned()
    }
}

#[async_trait]
impl BrokerConnector for MockBrokerConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        _timeout: Duration,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut by_port = lock(&self.state.attempts_by_port);
            let count = by_port.entry(endpoint.port).or_default();
            *count = count.saturating_add(1);
        }

        let delay = *lock(&self.state.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.refuse_all.load(Ordering::SeqCst)
            || lock(&self.state.refused_ports).contains(&endpoint.port)
        {
            return Err(BrokerError::Refused(endpoint.to_string()));
        }
        if let Some(error) = lock(&self.state.scripted).pop_front() {
            return Err(error);
        }

        let client = Arc::new(MockBrokerClient {
            endpoint: endpoint.clone(),
            connected: AtomicBool::new(!self.state.dead_on_arrival.load(Ordering::SeqCst)),
            disconnect_fails: self.state.disconnect_fails.load(Ordering::SeqCst),
            disconnects: AtomicU32::new(0),
            accounts: vec![format!("DU{:06}", endpoint.client_id)],
        });
        lock(&self.state.clients).push(Arc::clone(&client));
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// In-memory credential vault.
#[derive(Debug, Clone, Default)]
pub struct MockVault {
    secrets: Arc<Mutex<HashMap<String, Credentials>>>,
    failures_left: Arc<AtomicU32>,
    unavailable: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<AtomicU32>,
}

impl MockVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret.
    #[must_use]
    pub fn with_secret(self, secret_ref: impl Into<String>, credentials: Credentials) -> Self {
        self.insert(secret_ref, credentials);
        self
    }

    /// Store a secret.
    pub fn insert(&self, secret_ref: impl Into<String>, credentials: Credentials) {
        lock(&self.secrets).insert(secret_ref.into(), credentials);
    }

    /// Delay every lookup by `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    /// Fail the next `n` lookups as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every lookup as unavailable while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of lookups.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VaultClient for MockVault {
    async fn get_credentials(&self, secret_ref: &str) -> Result<Credentials, VaultError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VaultError::Unavailable("mock vault offline".into()));
        }
        let scripted = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(VaultError::Unavailable("mock vault 503".into()));
        }
        lock(&self.secrets)
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(secret_ref.to_string()))
    }
}
