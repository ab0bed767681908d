//! Creates or adopts the per-follower gateway container.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::GatewaySettings;
use crate::container::{
    ContainerError, ContainerHandle, ContainerLookup, ContainerRuntime, ContainerSpec,
    sanitize_name,
};
use crate::credentials::CredentialResolver;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventSink, GatewayEvent};
use crate::fleet::{Fleet, Reservation};
use crate::follower::Follower;
use crate::instance::GatewayInstance;
use crate::vault::Credentials;

/// Label carrying the follower id on every gateway container.
pub const FOLLOWER_LABEL: &str = "copytrade.follower_id";

/// Label marking containers managed by this crate.
pub const MANAGED_LABEL: &str = "copytrade.managed";

/// Label recording the host port the container publishes its API on.
pub const HOST_PORT_LABEL: &str = "copytrade.host_port";

/// Label recording the broker client id baked into the container.
pub const CLIENT_ID_LABEL: &str = "copytrade.client_id";

/// Whether a container's labels say it was created for exactly this
/// follower and reservation.
fn bound_to(labels: &BTreeMap<String, String>, follower_id: &str, reservation: Reservation) -> bool {
    let label = |key: &str| labels.get(key).map(String::as_str);
    label(FOLLOWER_LABEL) == Some(follower_id)
        && label(HOST_PORT_LABEL) == Some(reservation.host_port.to_string().as_str())
        && label(CLIENT_ID_LABEL) == Some(reservation.client_id.to_string().as_str())
}

/// Launches gateway containers and registers their instances.
pub struct ContainerLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: CredentialResolver,
    settings: GatewaySettings,
    container_timeout: Duration,
    events: EventSink,
}

impl ContainerLauncher {
    /// Create a launcher.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: CredentialResolver,
        settings: GatewaySettings,
        container_timeout: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            runtime,
            resolver,
            settings,
            container_timeout,
            events,
        }
    }

    /// Deterministic container name for a follower.
    #[must_use]
    pub fn container_name(&self, follower_id: &str) -> String {
        format!("{}{}", self.settings.container_name_prefix, sanitize_name(follower_id))
    }

    /// Launch (or adopt) the gateway for `follower` and register it in
    /// `fleet` as [`Starting`](crate::instance::GatewayStatus::Starting).
    ///
    /// Returns as soon as the instance is registered; the broker session is
    /// brought up by the health monitor.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::AlreadyRunning`] if the follower already has an instance
    /// - [`GatewayError::ResourceExhausted`] if either pool is empty
    /// - [`GatewayError::CredentialResolutionFailed`] if credentials cannot be resolved
    /// - [`GatewayError::Container`] if the runtime fails
    ///
    /// On every error the reserved port and client id are back in the pools.
    pub async fn start_gateway(
        &self,
        fleet: &Fleet,
        follower: &Follower,
    ) -> GatewayResult<Arc<GatewayInstance>> {
        if fleet.contains(&follower.id).await {
            return Err(GatewayError::AlreadyRunning(follower.id.clone()));
        }

        let reservation = match fleet.reserve().await {
            Ok(r) => r,
            Err(e) => {
                if let GatewayError::ResourceExhausted { resource, .. } = &e {
                    error!(follower_id = %follower.id, %resource, "Resource pool exhausted");
                    self.events.emit(GatewayEvent::ResourceExhausted {
                        follower_id: follower.id.clone(),
                        resource: *resource,
                    });
                }
                return Err(e);
            },
        };

        match self.launch_reserved(fleet, follower, reservation).await {
            Ok(instance) => {
                info!(
                    follower_id = %follower.id,
                    host_port = reservation.host_port,
                    client_id = reservation.client_id,
                    container = %instance.container_name(),
                    "Gateway registered"
                );
                self.events.emit(GatewayEvent::Launched {
                    follower_id: follower.id.clone(),
                    host_port: reservation.host_port,
                    client_id: reservation.client_id,
                });
                Ok(instance)
            },
            Err(e) => {
                fleet.release(reservation).await;
                warn!(follower_id = %follower.id, error = %e, "Gateway launch failed, resources released");
                if !matches!(e, GatewayError::CredentialResolutionFailed { .. }) {
                    self.events.emit(GatewayEvent::LaunchFailed {
                        follower_id: follower.id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e)
            },
        }
    }

    async fn launch_reserved(
        &self,
        fleet: &Fleet,
        follower: &Follower,
        reservation: Reservation,
    ) -> GatewayResult<Arc<GatewayInstance>> {
        let credentials = self.resolver.resolve(follower).await?;
        let name = self.container_name(&follower.id);

        let container = match self.with_timeout(self.runtime.get(&name)).await? {
            ContainerLookup::Found(handle) if bound_to(&handle.labels(), &follower.id, reservation) => {
                debug!(follower_id = %follower.id, container = %name, "Adopting existing container");
                handle
            },
            ContainerLookup::Found(stale) => {
                info!(
                    follower_id = %follower.id,
                    container = %name,
                    host_port = reservation.host_port,
                    client_id = reservation.client_id,
                    "Existing container bound to other resources, recreating"
                );
                match self.with_timeout(stale.remove(true)).await {
                    Ok(()) | Err(ContainerError::Gone(_)) => {},
                    Err(e) => return Err(e.into()),
                }
                self.create(follower, &name, &credentials, reservation).await?
            },
            ContainerLookup::NotFound => self.create(follower, &name, &credentials, reservation).await?,
        };
        drop(credentials);

        let instance = Arc::new(GatewayInstance::new(
            follower.id.clone(),
            Arc::clone(&container),
            reservation.host_port,
            reservation.client_id,
            self.events.clone(),
        ));
        if let Err(e) = fleet.register(Arc::clone(&instance)).await {
            // Nobody will tear this container down once the fleet is closed.
            if matches!(e, GatewayError::ShuttingDown) {
                warn!(follower_id = %follower.id, container = %name, "Shutdown began during launch, removing container");
                match self.with_timeout(container.remove(true)).await {
                    Ok(()) | Err(ContainerError::Gone(_)) => {},
                    Err(remove_err) => {
                        warn!(follower_id = %follower.id, error = %remove_err, "Could not remove orphaned container");
                    },
                }
            }
            return Err(e);
        }
        Ok(instance)
    }

    async fn create(
        &self,
        follower: &Follower,
        name: &str,
        credentials: &Credentials,
        reservation: Reservation,
    ) -> GatewayResult<Arc<dyn ContainerHandle>> {
        let spec = self.container_spec(follower, name, credentials, reservation);
        debug!(follower_id = %follower.id, ?spec, "Creating gateway container");
        Ok(self.with_timeout(self.runtime.run(&spec)).await?)
    }

    /// Build the container spec for a follower.
    #[must_use]
    pub fn container_spec(
        &self,
        follower: &Follower,
        name: &str,
        credentials: &Credentials,
        reservation: Reservation,
    ) -> ContainerSpec {
        let mut env = self.settings.extra_env.clone();
        env.insert("TWS_USERID".into(), credentials.username.clone());
        if let Some(password) = credentials.password.as_deref() {
            env.insert("TWS_PASSWORD".into(), password.to_string());
        }
        env.insert("TRADING_MODE".into(), self.settings.trading_mode.clone());
        env.insert("IBKR_CLIENT_ID".into(), reservation.client_id.to_string());
        env.insert("GATEWAY_HOST_PORT".into(), reservation.host_port.to_string());
        env.insert("FOLLOWER_ID".into(), follower.id.clone());

        let labels = BTreeMap::from([
            (FOLLOWER_LABEL.to_string(), follower.id.clone()),
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (HOST_PORT_LABEL.to_string(), reservation.host_port.to_string()),
            (CLIENT_ID_LABEL.to_string(), reservation.client_id.to_string()),
        ]);

        ContainerSpec {
            image: self.settings.image.clone(),
            name: name.to_string(),
            env,
            ports: BTreeMap::from([(self.settings.container_api_port, reservation.host_port)]),
            labels,
        }
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, ContainerError>>,
    ) -> Result<T, ContainerError> {
        tokio::time::timeout(self.container_timeout, call)
            .await
            .map_err(|_| ContainerError::Timeout(self.container_timeout))?
    }
}

impl std::fmt::Debug for ContainerLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLauncher")
            .field("settings", &self.settings)
            .field("container_timeout", &self.container_timeout)
            .finish_non_exhaustive()
    }
}
