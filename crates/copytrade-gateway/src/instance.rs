//! Per-follower gateway state record.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::broker::{BrokerClient, BrokerEndpoint};
use crate::container::{ContainerHandle, ContainerStatus};
use crate::events::{EventSink, GatewayEvent};

/// Lifecycle status of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    /// Container launched, broker session not yet established.
    Starting,
    /// Container running and broker session connected.
    Running,
    /// Torn down. Terminal.
    Stopped,
    /// Container down or broker session lost.
    Error,
}

impl GatewayStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Read-only view of one gateway, as returned by `list_gateways`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySummary {
    /// Current status.
    pub status: GatewayStatus,
    /// Host port.
    pub host_port: u16,
    /// Broker client id.
    pub client_id: u32,
    /// Container name.
    pub container_name: String,
    /// Container id.
    pub container_id: String,
    /// Whether a connected broker session is held.
    pub connected: bool,
    /// Last completed health check.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Last recorded failure.
    pub last_error: Option<String>,
}

/// State of one follower's gateway.
///
/// Identity fields (follower id, container, port, client id) are fixed at
/// creation. Mutable fields sit behind their own locks so the health monitor
/// and consumers can touch one instance without holding the fleet lock.
pub struct GatewayInstance {
    follower_id: String,
    container_name: String,
    container_id: String,
    host_port: u16,
    client_id: u32,
    container: Arc<dyn ContainerHandle>,
    created_at: DateTime<Utc>,
    status: RwLock<GatewayStatus>,
    api_client: RwLock<Option<Arc<dyn BrokerClient>>>,
    last_checked_at: RwLock<Option<DateTime<Utc>>>,
    last_container_status: RwLock<ContainerStatus>,
    last_error: RwLock<Option<String>>,
    connect_lock: Mutex<()>,
    events: EventSink,
}

impl GatewayInstance {
    /// Create an instance in [`GatewayStatus::Starting`].
    #[must_use]
    pub fn new(
        follower_id: impl Into<String>,
        container: Arc<dyn ContainerHandle>,
        host_port: u16,
        client_id: u32,
        events: EventSink,
    ) -> Self {
        let last_container_status = container.status();
        Self {
            follower_id: follower_id.into(),
            container_name: container.name(),
            container_id: container.id(),
            host_port,
            client_id,
            container,
            created_at: Utc::now(),
            status: RwLock::new(GatewayStatus::Starting),
            api_client: RwLock::new(None),
            last_checked_at: RwLock::new(None),
            last_container_status: RwLock::new(last_container_status),
            last_error: RwLock::new(None),
            connect_lock: Mutex::new(()),
            events,
        }
    }

    /// Follower id.
    #[must_use]
    pub fn follower_id(&self) -> &str {
        &self.follower_id
    }

    /// Container name.
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Container id.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Host port published for the broker API.
    #[must_use]
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Broker client id.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Container handle.
    #[must_use]
    pub fn container(&self) -> &Arc<dyn ContainerHandle> {
        &self.container
    }

    /// When the instance was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Broker endpoint for this gateway on `host`.
    #[must_use]
    pub fn endpoint(&self, host: &str) -> BrokerEndpoint {
        BrokerEndpoint {
            host: host.to_string(),
            port: self.host_port,
            client_id: self.client_id,
        }
    }

    /// Current status.
    pub async fn status(&self) -> GatewayStatus {
        *self.status.read().await
    }

    /// Move to `next`. Returns `false` if the instance is already stopped.
    pub async fn set_status(&self, next: GatewayStatus) -> bool {
        let mut status = self.status.write().await;
        let prev = *status;
        if prev.is_terminal() {
            return next == prev;
        }
        if prev != next {
            *status = next;
            drop(status);
            self.events.emit(GatewayEvent::StatusChanged {
                follower_id: self.follower_id.clone(),
                from: prev,
                to: next,
            });
        }
        true
    }

    /// Mark healthy and clear the last error.
    pub async fn mark_running(&self) -> bool {
        if self.set_status(GatewayStatus::Running).await {
            *self.last_error.write().await = None;
            true
        } else {
            false
        }
    }

    /// Record `error` and move to [`GatewayStatus::Error`].
    pub async fn set_error(&self, error: impl Into<String>) -> bool {
        if self.set_status(GatewayStatus::Error).await {
            *self.last_error.write().await = Some(error.into());
            true
        } else {
            false
        }
    }

    /// Record `error` without changing status.
    pub async fn record_error(&self, error: impl Into<String>) {
        *self.last_error.write().await = Some(error.into());
    }

    /// Last recorded error.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Move to [`GatewayStatus::Stopped`] and hand back the broker session,
    /// if any, for the caller to close.
    pub async fn mark_stopped(&self) -> Option<Arc<dyn BrokerClient>> {
        self.set_status(GatewayStatus::Stopped).await;
        self.api_client.write().await.take()
    }

    /// Store a freshly connected session.
    ///
    /// Returns the replaced session for the caller to close. If the instance
    /// is already stopped the new session is not stored and comes back as the
    /// error so the caller can close it.
    pub async fn attach_client(
        &self,
        client: Arc<dyn BrokerClient>,
    ) -> Result<Option<Arc<dyn BrokerClient>>, Arc<dyn BrokerClient>> {
        // Status lock first, same order as mark_stopped.
        let status = self.status.read().await;
        if status.is_terminal() {
            return Err(client);
        }
        let replaced = self.api_client.write().await.replace(client);
        drop(status);
        Ok(replaced)
    }

    /// Remove and return the current session.
    pub async fn take_client(&self) -> Option<Arc<dyn BrokerClient>> {
        self.api_client.write().await.take()
    }

    /// Current session, connected or not.
    pub async fn client(&self) -> Option<Arc<dyn BrokerClient>> {
        self.api_client.read().await.clone()
    }

    /// Current session if it reports connected.
    pub async fn connected_client(&self) -> Option<Arc<dyn BrokerClient>> {
        self.api_client
            .read()
            .await
            .as_ref()
            .filter(|client| client.is_connected())
            .cloned()
    }

    /// Whether a connected session is held.
    pub async fn is_connected(&self) -> bool {
        self.api_client
            .read()
            .await
            .as_ref()
            .is_some_and(|client| client.is_connected())
    }

    /// Record a container status observation.
    pub async fn record_container_status(&self, status: ContainerStatus) {
        *self.last_container_status.write().await = status;
    }

    /// Last observed container status.
    pub async fn last_container_status(&self) -> ContainerStatus {
        *self.last_container_status.read().await
    }

    /// Stamp a completed health check.
    pub async fn touch(&self) {
        *self.last_checked_at.write().await = Some(Utc::now());
    }

    /// Last completed health check.
    pub async fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        *self.last_checked_at.read().await
    }

    /// Serialise connection attempts against this gateway.
    pub async fn connect_guard(&self) -> MutexGuard<'_, ()> {
        self.connect_lock.lock().await
    }

    /// Snapshot for reporting.
    pub async fn summary(&self) -> GatewaySummary {
        GatewaySummary {
            status: self.status().await,
            host_port: self.host_port,
            client_id: self.client_id,
            container_name: self.container_name.clone(),
            container_id: self.container_id.clone(),
            connected: self.is_connected().await,
            last_checked_at: self.last_checked_at().await,
            last_error: self.last_error().await,
        }
    }
}

impl fmt::Debug for GatewayInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayInstance")
            .field("follower_id", &self.follower_id)
            .field("container_name", &self.container_name)
            .field("container_id", &self.container_id)
            .field("host_port", &self.host_port)
            .field("client_id", &self.client_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
