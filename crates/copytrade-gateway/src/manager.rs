//! Gateway manager: reconciles desired followers against running gateways.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::broker::{BrokerClient, BrokerConnector};
use crate::config::GatewayManagerConfig;
use crate::container::{ContainerError, ContainerRuntime};
use crate::credentials::CredentialResolver;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventSink, GatewayEvent};
use crate::fleet::{Fleet, PoolUsage};
use crate::follower::{Follower, FollowerStore};
use crate::health::{HealthStatus, fleet_health};
use crate::instance::{GatewayInstance, GatewayStatus, GatewaySummary};
use crate::launcher::ContainerLauncher;
use crate::monitor::{HealthMonitor, SweepSummary};
use crate::supervisor::{ConnectionSupervisor, close_quietly};
use crate::vault::VaultClient;

/// External systems the manager drives.
pub struct Collaborators {
    /// Desired-state store.
    pub store: Arc<dyn FollowerStore>,
    /// Credential vault; `None` if every follower carries an inline username.
    pub vault: Option<Arc<dyn VaultClient>>,
    /// Container runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Broker API connector.
    pub broker: Arc<dyn BrokerConnector>,
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Followers whose gateway was launched.
    pub started: Vec<String>,
    /// Followers whose gateway was torn down.
    pub stopped: Vec<String>,
    /// Followers whose launch or teardown failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    /// Whether the pass changed nothing and nothing failed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

/// Owns the follower → gateway map and every gateway's lifecycle.
pub struct GatewayManager {
    config: GatewayManagerConfig,
    store: Arc<dyn FollowerStore>,
    launcher: ContainerLauncher,
    supervisor: Arc<ConnectionSupervisor>,
    monitor: HealthMonitor,
    fleet: Arc<Fleet>,
    follower_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: EventSink,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    launch_checks: Mutex<JoinSet<()>>,
    started_at: Instant,
}

impl GatewayManager {
    /// Create a manager. Nothing is launched until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn new(config: GatewayManagerConfig, collaborators: Collaborators) -> GatewayResult<Self> {
        config.validate()?;

        let events = EventSink::default();
        let shutdown = CancellationToken::new();
        let fleet = Arc::new(Fleet::new(
            (config.pools.port_start, config.pools.port_end),
            (config.pools.client_id_start, config.pools.client_id_end),
        )?);

        let resolver = CredentialResolver::new(
            collaborators.vault,
            config.retry.vault.clone(),
            events.clone(),
        );
        let launcher = ContainerLauncher::new(
            collaborators.runtime,
            resolver,
            config.gateway.clone(),
            config.container_timeout(),
            events.clone(),
        );
        let supervisor = Arc::new(ConnectionSupervisor::new(
            collaborators.broker,
            config.gateway.broker_host.clone(),
            config.retry.connect.clone(),
            config.connect_timeout(),
            shutdown.clone(),
        ));
        let monitor = HealthMonitor::new(
            Arc::clone(&fleet),
            Arc::clone(&supervisor),
            config.healthcheck_interval(),
            config.max_startup_time(),
            config.container_timeout(),
        );

        Ok(Self {
            config,
            store: collaborators.store,
            launcher,
            supervisor,
            monitor,
            fleet,
            follower_locks: Mutex::new(HashMap::new()),
            events,
            shutdown,
            shutting_down: AtomicBool::new(false),
            monitor_task: Mutex::new(None),
            launch_checks: Mutex::new(JoinSet::new()),
            started_at: Instant::now(),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &GatewayManagerConfig {
        &self.config
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> GatewayResult<()> {
        if self.is_shutting_down() {
            Err(GatewayError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn follower_lock(&self, follower_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.follower_locks.lock().await;
        Arc::clone(locks.entry(follower_id.to_string()).or_default())
    }

    async fn forget_lock(&self, follower_id: &str) {
        let mut locks = self.follower_locks.lock().await;
        // Only the map holds it: nobody is waiting.
        if locks
            .get(follower_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(follower_id);
        }
    }

    /// Launch gateways for every enabled follower and start the health
    /// monitor.
    ///
    /// Individual launch failures are reported, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the manager is
    /// shutting down.
    pub async fn start(&self) -> GatewayResult<ReconcileReport> {
        self.ensure_accepting()?;
        info!(
            image = %self.config.gateway.image,
            ports = ?(self.config.pools.port_start, self.config.pools.port_end),
            "Starting gateway manager"
        );

        let desired = self.store.find_enabled_followers().await?;
        let mut report = ReconcileReport::default();
        self.launch_all(&desired, &mut report).await;
        self.spawn_monitor().await;

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Gateway manager started"
        );
        Ok(report)
    }

    async fn spawn_monitor(&self) {
        let mut slot = self.monitor_task.lock().await;
        if slot.is_none() {
            *slot = Some(self.monitor.clone().spawn(self.shutdown.clone()));
        }
    }

    async fn launch_all(&self, followers: &[Follower], report: &mut ReconcileReport) {
        let mut pending = Vec::new();
        for follower in followers {
            if !self.fleet.contains(&follower.id).await {
                pending.push(follower);
            }
        }

        let results = join_all(pending.iter().map(|f| self.launch_follower(f))).await;
        for (follower, result) in pending.into_iter().zip(results) {
            match result {
                Ok(_) => report.started.push(follower.id.clone()),
                Err(GatewayError::AlreadyRunning(_)) => {},
                Err(e) => report.failed.push((follower.id.clone(), e.to_string())),
            }
        }
    }

    async fn launch_follower(&self, follower: &Follower) -> GatewayResult<Arc<GatewayInstance>> {
        let lock = self.follower_lock(&follower.id).await;
        let result = {
            let _guard = lock.lock().await;
            self.launch_locked(follower).await
        };
        if result.is_err() {
            drop(lock);
            self.forget_lock(&follower.id).await;
        }
        result
    }

    async fn launch_locked(&self, follower: &Follower) -> GatewayResult<Arc<GatewayInstance>> {
        // Checked under the follower lock: `stop` drains these locks after
        // raising the flag, so a launch either finishes before teardown or
        // never starts.
        self.ensure_accepting()?;

        let instance = self.launcher.start_gateway(&self.fleet, follower).await?;
        if self.config.gateway.connect_on_launch && !self.is_shutting_down() {
            let monitor = self.monitor.clone();
            let target = Arc::clone(&instance);
            let mut checks = self.launch_checks.lock().await;
            while checks.try_join_next().is_some() {}
            checks.spawn(async move {
                monitor.check_instance(&target).await;
            });
        }
        Ok(instance)
    }

    /// Bring the running set in line with the store: launch newly enabled
    /// followers and tear down gateways no longer desired.
    ///
    /// A second pass over unchanged desired state does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the manager is
    /// shutting down.
    pub async fn reload_followers(&self) -> GatewayResult<ReconcileReport> {
        self.ensure_accepting()?;

        let desired = self.store.find_enabled_followers().await?;
        let desired_ids: HashSet<&str> = desired.iter().map(|f| f.id.as_str()).collect();
        let mut report = ReconcileReport::default();

        for follower_id in self.fleet.follower_ids().await {
            if desired_ids.contains(follower_id.as_str()) {
                continue;
            }
            match self.stop_follower_gateway(&follower_id).await {
                Ok(()) => report.stopped.push(follower_id),
                Err(GatewayError::GatewayNotFound(_)) => {},
                Err(e) => {
                    // Resources are released even when the container side failed.
                    report.failed.push((follower_id.clone(), e.to_string()));
                    report.stopped.push(follower_id);
                },
            }
        }

        self.launch_all(&desired, &mut report).await;

        if report.is_noop() {
            debug!("Reconciliation found nothing to do");
        } else {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "Reconciliation complete"
            );
        }
        Ok(report)
    }

    /// Launch the gateway for one follower.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::FollowerNotFound`] if the store has no such follower
    /// - [`GatewayError::FollowerNotEligible`] if it is disabled or not active
    /// - [`GatewayError::AlreadyRunning`] if it already has a gateway
    /// - any launch error
    pub async fn launch_gateway(&self, follower_id: &str) -> GatewayResult<GatewaySummary> {
        self.ensure_accepting()?;
        let follower = self
            .store
            .get_follower(follower_id)
            .await?
            .ok_or_else(|| GatewayError::FollowerNotFound(follower_id.to_string()))?;
        if !follower.is_eligible() {
            return Err(GatewayError::FollowerNotEligible(follower_id.to_string()));
        }

        let instance = self.launch_follower(&follower).await?;
        Ok(instance.summary().await)
    }

    /// Broker session for a follower, if one can be had.
    ///
    /// Returns the cached session when healthy. Otherwise, if the container
    /// was last seen running, makes one immediate connect attempt. Never
    /// returns a disconnected session.
    pub async fn get_client(&self, follower_id: &str) -> Option<Arc<dyn BrokerClient>> {
        let instance = self.fleet.get(follower_id).await?;
        let status = instance.status().await;
        if status == GatewayStatus::Stopped {
            return None;
        }
        if status == GatewayStatus::Running
            && let Some(client) = instance.connected_client().await
        {
            return Some(client);
        }

        if self.is_shutting_down() || !instance.last_container_status().await.is_running() {
            return None;
        }

        debug!(%follower_id, %status, "No live session, attempting one reconnect");
        match self
            .supervisor
            .connect_with_policy(&instance, &BackoffPolicy::single_attempt())
            .await
        {
            Ok(client) if client.is_connected() => {
                instance.mark_running().await;
                Some(client)
            },
            Ok(_) => {
                warn!(%follower_id, "Broker session dropped right after connect");
                if let Some(dead) = instance.take_client().await {
                    close_quietly(follower_id, dead.as_ref()).await;
                }
                instance.set_error("broker session dropped right after connect").await;
                None
            },
            Err(e) => {
                warn!(%follower_id, error = %e, "On-demand reconnect failed");
                instance.set_error(e.to_string()).await;
                None
            },
        }
    }

    /// Drop the current session and reconnect with the full retry policy.
    ///
    /// Returns whether a session is up afterwards.
    pub async fn reconnect(&self, follower_id: &str) -> bool {
        let Some(instance) = self.fleet.get(follower_id).await else {
            return false;
        };
        if instance.status().await == GatewayStatus::Stopped {
            return false;
        }

        if let Some(old) = instance.take_client().await {
            close_quietly(follower_id, old.as_ref()).await;
        }

        match self.supervisor.connect(&instance).await {
            Ok(_) => instance.mark_running().await,
            Err(e) => {
                warn!(%follower_id, error = %e, "Reconnect failed");
                instance.set_error(e.to_string()).await;
                false
            },
        }
    }

    /// Whether the follower's gateway is running with a live session.
    ///
    /// Refreshes the container status but does not change gateway status.
    pub async fn is_healthy(&self, follower_id: &str) -> bool {
        let Some(instance) = self.fleet.get(follower_id).await else {
            return false;
        };

        let timeout = self.config.container_timeout();
        let container_running = match tokio::time::timeout(timeout, instance.container().reload()).await {
            Ok(Ok(status)) => {
                instance.record_container_status(status).await;
                status.is_running()
            },
            Ok(Err(e)) => {
                debug!(%follower_id, error = %e, "Container reload failed");
                false
            },
            Err(_) => false,
        };

        container_running
            && instance.status().await == GatewayStatus::Running
            && instance.is_connected().await
    }

    /// Tear down one follower's gateway.
    ///
    /// The instance is always unregistered and its port and client id
    /// released, even when the container could not be removed.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::GatewayNotFound`] if the follower has no gateway
    /// - [`GatewayError::ContainerTeardownFailed`] if stop and forced removal
    ///   both failed (reported after cleanup)
    pub async fn stop_follower_gateway(&self, follower_id: &str) -> GatewayResult<()> {
        let lock = self.follower_lock(follower_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.teardown(follower_id).await
        };
        drop(lock);
        self.forget_lock(follower_id).await;
        result
    }

    async fn teardown(&self, follower_id: &str) -> GatewayResult<()> {
        let Some(instance) = self.fleet.get(follower_id).await else {
            return Err(GatewayError::GatewayNotFound(follower_id.to_string()));
        };
        info!(
            %follower_id,
            host_port = instance.host_port(),
            client_id = instance.client_id(),
            "Stopping gateway"
        );

        if let Some(client) = instance.mark_stopped().await {
            close_quietly(follower_id, client.as_ref()).await;
        }

        let container_result = self.remove_container(&instance).await;

        self.fleet.unregister(follower_id).await;
        self.events.emit(GatewayEvent::Stopped {
            follower_id: follower_id.to_string(),
        });

        container_result.map_err(|reason| {
            warn!(%follower_id, %reason, "Container teardown failed, resources released anyway");
            GatewayError::ContainerTeardownFailed {
                follower_id: follower_id.to_string(),
                reason,
            }
        })
    }

    async fn remove_container(&self, instance: &GatewayInstance) -> Result<(), String> {
        let container = instance.container();
        let stop_timeout = self.config.stop_timeout();
        let call_timeout = self.config.container_timeout();

        let graceful = async {
            gone_is_ok(container.stop(stop_timeout).await)?;
            gone_is_ok(container.remove(false).await)?;
            Ok::<(), ContainerError>(())
        };
        match tokio::time::timeout(stop_timeout.saturating_add(call_timeout), graceful).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!(follower_id = %instance.follower_id(), error = %e, "Graceful stop failed, forcing removal");
            },
            Err(_) => {
                warn!(follower_id = %instance.follower_id(), "Graceful stop timed out, forcing removal");
            },
        }

        match tokio::time::timeout(call_timeout, container.remove(true)).await {
            Ok(result) => gone_is_ok(result).map_err(|e| e.to_string()),
            Err(_) => Err(format!("forced removal timed out after {call_timeout:?}")),
        }
    }

    /// Shut down: stop the monitor, wait for in-flight launches, tear down
    /// every gateway, clear the pools.
    ///
    /// A second call is a no-op.
    pub async fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Gateway manager already stopping");
            return;
        }
        info!("Stopping gateway manager");
        self.shutdown.cancel();

        let monitor = self.monitor_task.lock().await.take();
        if let Some(handle) = monitor {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(Ok(())) => debug!("Health monitor exited"),
                Ok(Err(e)) => warn!(error = %e, "Health monitor task failed"),
                Err(_) => {
                    warn!(
                        timeout = ?self.config.shutdown_timeout(),
                        "Health monitor did not stop in time, aborting"
                    );
                    abort.abort();
                },
            }
        }
        self.drain_launches().await;
        self.fleet.close().await;
        self.drain_launch_checks().await;

        let follower_ids = self.fleet.follower_ids().await;
        let results = join_all(follower_ids.iter().map(|id| self.stop_follower_gateway(id))).await;
        for (follower_id, result) in follower_ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(%follower_id, error = %e, "Gateway teardown during shutdown failed");
            }
        }

        self.fleet.clear().await;
        info!(
            uptime = ?self.started_at.elapsed(),
            "Gateway manager stopped"
        );
    }

    /// Wait for launches already holding a follower lock.
    async fn drain_launches(&self) {
        let locks: Vec<Arc<Mutex<()>>> = self.follower_locks.lock().await.values().cloned().collect();
        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            for lock in &locks {
                drop(lock.lock().await);
            }
        })
        .await;
        if drained.is_err() {
            warn!(?timeout, "In-flight launches did not finish in time");
        }
    }

    /// Let one-shot launch checks observe cancellation and finish, aborting
    /// whatever is left past the shutdown timeout.
    async fn drain_launch_checks(&self) {
        let mut checks = self.launch_checks.lock().await;
        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = checks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Launch health check task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(?timeout, "Launch health checks did not finish in time, aborting");
            checks.shutdown().await;
        }
    }

    /// Status of a follower's gateway.
    pub async fn get_gateway_status(&self, follower_id: &str) -> Option<GatewayStatus> {
        Some(self.fleet.get(follower_id).await?.status().await)
    }

    /// Summaries of every gateway, keyed by follower id.
    pub async fn list_gateways(&self) -> BTreeMap<String, GatewaySummary> {
        let mut gateways = BTreeMap::new();
        for instance in self.fleet.snapshot().await {
            gateways.insert(instance.follower_id().to_string(), instance.summary().await);
        }
        gateways
    }

    /// Run one health sweep now.
    pub async fn run_health_sweep(&self) -> SweepSummary {
        self.monitor.sweep().await
    }

    /// Aggregate health of the fleet and pools.
    pub async fn health_report(&self) -> HealthStatus {
        let gateways = self.list_gateways().await;
        let pools = self.fleet.pool_usage().await;
        fleet_health(&gateways, &pools, self.started_at.elapsed())
    }

    /// Subscribe to gateway events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Allocated ports and client ids.
    pub async fn pool_usage(&self) -> PoolUsage {
        self.fleet.pool_usage().await
    }

    /// Uptime since construction.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn gone_is_ok(result: Result<(), ContainerError>) -> Result<(), ContainerError> {
    match result {
        Err(ContainerError::Gone(_)) => Ok(()),
        other => other,
    }
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager")
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
