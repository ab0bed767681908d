//! Periodic health sweeps over the fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fleet::Fleet;
use crate::instance::{GatewayInstance, GatewayStatus};
use crate::supervisor::ConnectionSupervisor;

/// Outcome counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Instances checked.
    pub checked: usize,
    /// Instances running after the check.
    pub running: usize,
    /// Instances still starting.
    pub starting: usize,
    /// Instances in error.
    pub errored: usize,
}

/// Drives instances through the status state machine.
#[derive(Clone)]
pub struct HealthMonitor {
    fleet: Arc<Fleet>,
    supervisor: Arc<ConnectionSupervisor>,
    interval: Duration,
    max_startup: Duration,
    container_timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        fleet: Arc<Fleet>,
        supervisor: Arc<ConnectionSupervisor>,
        interval: Duration,
        max_startup: Duration,
        container_timeout: Duration,
    ) -> Self {
        Self {
            fleet,
            supervisor,
            interval,
            max_startup,
            container_timeout,
        }
    }

    /// Check every registered instance concurrently and wait for all checks.
    pub async fn sweep(&self) -> SweepSummary {
        let instances = self.fleet.snapshot().await;
        let mut set = JoinSet::new();
        for instance in instances {
            let monitor = self.clone();
            set.spawn(async move { monitor.check_instance(&instance).await });
        }

        let mut summary = SweepSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(status) => {
                    summary.checked = summary.checked.saturating_add(1);
                    match status {
                        GatewayStatus::Running => summary.running = summary.running.saturating_add(1),
                        GatewayStatus::Starting => summary.starting = summary.starting.saturating_add(1),
                        GatewayStatus::Error => summary.errored = summary.errored.saturating_add(1),
                        GatewayStatus::Stopped => {},
                    }
                },
                Err(e) => error!(error = %e, "Health check task failed"),
            }
        }
        debug!(?summary, "Health sweep complete");
        summary
    }

    /// Run one health check against `instance` and return its status afterwards.
    pub async fn check_instance(&self, instance: &GatewayInstance) -> GatewayStatus {
        let follower_id = instance.follower_id();
        let status = instance.status().await;
        if status == GatewayStatus::Stopped {
            return status;
        }

        let container_status = match tokio::time::timeout(self.container_timeout, instance.container().reload()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                warn!(%follower_id, error = %e, "Container status reload failed");
                return self.container_down(instance, status, &format!("container reload failed: {e}")).await;
            },
            Err(_) => {
                warn!(%follower_id, timeout = ?self.container_timeout, "Container status reload timed out");
                return self.container_down(instance, status, "container reload timed out").await;
            },
        };
        instance.record_container_status(container_status).await;

        if !container_status.is_running() {
            return self
                .container_down(instance, status, &format!("container is {container_status}"))
                .await;
        }

        if !instance.is_connected().await {
            if status == GatewayStatus::Running {
                warn!(%follower_id, "Broker session lost, reconnecting");
            }
            match self.supervisor.connect(instance).await {
                Ok(_) => {
                    if instance.mark_running().await {
                        info!(%follower_id, "Gateway running");
                    }
                },
                Err(e) => {
                    error!(%follower_id, error = %e, "Broker reconnect failed");
                    instance.set_error(e.to_string()).await;
                },
            }
        } else {
            instance.mark_running().await;
        }

        instance.touch().await;
        instance.status().await
    }

    async fn container_down(
        &self,
        instance: &GatewayInstance,
        status: GatewayStatus,
        reason: &str,
    ) -> GatewayStatus {
        if status == GatewayStatus::Starting && instance.age() < self.max_startup {
            debug!(follower_id = %instance.follower_id(), reason, "Container not up yet, within startup grace");
            instance.record_error(reason).await;
        } else {
            if status != GatewayStatus::Error {
                error!(follower_id = %instance.follower_id(), reason, "Gateway container down");
            }
            instance.set_error(reason).await;
        }
        instance.touch().await;
        instance.status().await
    }

    /// Spawn the periodic loop. The first sweep runs one interval after
    /// spawning. The loop exits at the first sweep boundary after `shutdown`
    /// fires; a sweep in progress always completes.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Health monitor started");

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                if shutdown.is_cancelled() {
                    break;
                }
                self.sweep().await;
            }

            info!("Health monitor stopped");
        })
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .field("max_startup", &self.max_startup)
            .field("container_timeout", &self.container_timeout)
            .finish_non_exhaustive()
    }
}
