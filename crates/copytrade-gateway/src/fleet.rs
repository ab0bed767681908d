//! The manager's instance map and resource pools, under one lock.
//!
//! Keeping the map and both pools behind the same mutex makes "resources are
//! held iff the instance is registered" a property of each critical section
//! instead of something callers have to coordinate. The lock is never held
//! across container or broker I/O.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{GatewayError, GatewayResult};
use crate::instance::GatewayInstance;
use crate::pool::{ClientIdPool, PortPool, ResourceKind, ResourcePool};

/// A port and client id reserved for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Host port.
    pub host_port: u16,
    /// Broker client id.
    pub client_id: u32,
}

/// Snapshot of pool utilisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Allocated ports, ascending.
    pub ports: Vec<u16>,
    /// Size of the port range.
    pub port_capacity: u64,
    /// Allocated client ids, ascending.
    pub client_ids: Vec<u32>,
    /// Size of the client id range.
    pub client_id_capacity: u64,
}

struct FleetState {
    instances: HashMap<String, Arc<GatewayInstance>>,
    ports: PortPool,
    client_ids: ClientIdPool,
    closed: bool,
}

/// Registry of live gateways plus the pools backing them.
pub struct Fleet {
    state: Mutex<FleetState>,
}

impl Fleet {
    /// Create an empty fleet over the given ranges.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if either range is inverted.
    pub fn new(ports: (u16, u16), client_ids: (u32, u32)) -> GatewayResult<Self> {
        Ok(Self {
            state: Mutex::new(FleetState {
                instances: HashMap::new(),
                ports: ResourcePool::new(ResourceKind::Port, ports.0, ports.1)?,
                client_ids: ResourcePool::new(ResourceKind::ClientId, client_ids.0, client_ids.1)?,
                closed: false,
            }),
        })
    }

    /// Reserve a port and a client id together.
    ///
    /// If the client id pool is exhausted the port is returned before the
    /// error surfaces.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ResourceExhausted`] naming the pool that ran
    /// dry, or [`GatewayError::ShuttingDown`] once the fleet is closed.
    pub async fn reserve(&self) -> GatewayResult<Reservation> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GatewayError::ShuttingDown);
        }
        let host_port = state.ports.allocate()?;
        match state.client_ids.allocate() {
            Ok(client_id) => Ok(Reservation {
                host_port,
                client_id,
            }),
            Err(e) => {
                state.ports.release(host_port);
                Err(e)
            },
        }
    }

    /// Return a reservation that never got registered.
    pub async fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock().await;
        state.ports.release(reservation.host_port);
        state.client_ids.release(reservation.client_id);
    }

    /// Register an instance whose resources were reserved via [`reserve`](Self::reserve).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AlreadyRunning`] if the follower already has an
    /// instance, or [`GatewayError::ShuttingDown`] once the fleet is closed.
    /// The reservation is left to the caller to release.
    pub async fn register(&self, instance: Arc<GatewayInstance>) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GatewayError::ShuttingDown);
        }
        if state.instances.contains_key(instance.follower_id()) {
            return Err(GatewayError::AlreadyRunning(
                instance.follower_id().to_string(),
            ));
        }
        state
            .instances
            .insert(instance.follower_id().to_string(), instance);
        Ok(())
    }

    /// Remove an instance and return its port and client id to the pools.
    pub async fn unregister(&self, follower_id: &str) -> Option<Arc<GatewayInstance>> {
        let mut state = self.state.lock().await;
        let instance = state.instances.remove(follower_id)?;
        state.ports.release(instance.host_port());
        state.client_ids.release(instance.client_id());
        Some(instance)
    }

    /// Refuse further reservations and registrations. Existing instances
    /// stay registered until unregistered or cleared.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    /// Whether [`close`](Self::close) has been called.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Instance for `follower_id`.
    pub async fn get(&self, follower_id: &str) -> Option<Arc<GatewayInstance>> {
        self.state.lock().await.instances.get(follower_id).cloned()
    }

    /// Whether `follower_id` has an instance.
    pub async fn contains(&self, follower_id: &str) -> bool {
        self.state.lock().await.instances.contains_key(follower_id)
    }

    /// Registered follower ids.
    pub async fn follower_ids(&self) -> Vec<String> {
        self.state.lock().await.instances.keys().cloned().collect()
    }

    /// Handles to every registered instance.
    pub async fn snapshot(&self) -> Vec<Arc<GatewayInstance>> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    /// Number of registered instances.
    pub async fn len(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Whether no instance is registered.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.instances.is_empty()
    }

    /// Drop every instance and free both pools.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.instances.clear();
        state.ports.clear();
        state.client_ids.clear();
    }

    /// Pool utilisation snapshot.
    pub async fn pool_usage(&self) -> PoolUsage {
        let state = self.state.lock().await;
        PoolUsage {
            ports: state.ports.used(),
            port_capacity: state.ports.capacity(),
            client_ids: state.client_ids.used(),
            client_id_capacity: state.client_ids.capacity(),
        }
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerError, ContainerHandle, ContainerStatus};
    use crate::events::EventSink;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Handle;

    #[async_trait]
    impl ContainerHandle for Handle {
        fn id(&self) -> String {
            "c".into()
        }
        fn name(&self) -> String {
            "c".into()
        }
        fn status(&self) -> ContainerStatus {
            ContainerStatus::Running
        }
        async fn reload(&self) -> Result<ContainerStatus, ContainerError> {
            Ok(ContainerStatus::Running)
        }
        async fn stop(&self, _timeout: Duration) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn remove(&self, _force: bool) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    fn instance(id: &str, r: Reservation) -> Arc<GatewayInstance> {
        Arc::new(GatewayInstance::new(
            id,
            Arc::new(Handle),
            r.host_port,
            r.client_id,
            EventSink::default(),
        ))
    }

    #[tokio::test]
    async fn reserve_is_atomic_on_client_id_exhaustion() {
        let fleet = Fleet::new((4100, 4110), (1, 1)).unwrap();
        let first = fleet.reserve().await.unwrap();
        assert_eq!(first.host_port, 4100);

        let err = fleet.reserve().await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ResourceExhausted {
                resource: ResourceKind::ClientId,
                ..
            }
        ));
        // The port taken for the failed reservation went back.
        assert_eq!(fleet.pool_usage().await.ports, vec![4100]);
    }

    #[tokio::test]
    async fn unregister_releases_resources() {
        let fleet = Fleet::new((4100, 4101), (10, 11)).unwrap();
        let r = fleet.reserve().await.unwrap();
        fleet.register(instance("f1", r)).await.unwrap();
        assert!(fleet.contains("f1").await);

        let removed = fleet.unregister("f1").await.unwrap();
        assert_eq!(removed.host_port(), 4100);
        assert!(fleet.is_empty().await);

        let usage = fleet.pool_usage().await;
        assert!(usage.ports.is_empty());
        assert!(usage.client_ids.is_empty());
        assert!(fleet.unregister("f1").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_register_rejected() {
        let fleet = Fleet::new((4100, 4105), (1, 5)).unwrap();
        let a = fleet.reserve().await.unwrap();
        let b = fleet.reserve().await.unwrap();
        fleet.register(instance("f1", a)).await.unwrap();

        let err = fleet.register(instance("f1", b)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyRunning(id) if id == "f1"));

        fleet.release(b).await;
        assert_eq!(fleet.pool_usage().await.ports, vec![4100]);
        assert_eq!(fleet.len().await, 1);
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let fleet = Fleet::new((4100, 4105), (1, 5)).unwrap();
        for id in ["a", "b", "c"] {
            let r = fleet.reserve().await.unwrap();
            fleet.register(instance(id, r)).await.unwrap();
        }
        assert_eq!(fleet.follower_ids().await.len(), 3);

        fleet.clear().await;
        let usage = fleet.pool_usage().await;
        assert!(fleet.snapshot().await.is_empty());
        assert!(usage.ports.is_empty());
        assert_eq!(usage.port_capacity, 6);
        assert_eq!(usage.client_id_capacity, 5);
    }

    #[tokio::test]
    async fn closed_fleet_refuses_new_work() {
        let fleet = Fleet::new((4100, 4105), (1, 5)).unwrap();
        let held = fleet.reserve().await.unwrap();
        let pending = fleet.reserve().await.unwrap();
        fleet.register(instance("f1", held)).await.unwrap();

        fleet.close().await;
        assert!(fleet.is_closed().await);
        assert!(matches!(fleet.reserve().await, Err(GatewayError::ShuttingDown)));
        assert!(matches!(
            fleet.register(instance("f2", pending)).await,
            Err(GatewayError::ShuttingDown)
        ));
        assert!(!fleet.contains("f2").await);

        // Teardown of what is already registered still works.
        fleet.release(pending).await;
        assert!(fleet.unregister("f1").await.is_some());
        assert!(fleet.pool_usage().await.ports.is_empty());
    }
}
