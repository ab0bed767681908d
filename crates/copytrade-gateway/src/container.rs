//! Container runtime interface.
//!
//! The runtime owns the gateway processes; the manager only keeps lookup
//! handles into it. A lookup by name that finds nothing is a normal
//! [`ContainerLookup::NotFound`] result, not an error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Created but never started.
    Created,
    /// Process is running.
    Running,
    /// Runtime is restarting the process.
    Restarting,
    /// Process is paused.
    Paused,
    /// Process has exited.
    Exited,
    /// Runtime gave up on the container.
    Dead,
    /// Not yet observed, or the runtime reported something unrecognised.
    #[default]
    Unknown,
}

impl ContainerStatus {
    /// Whether the gateway process is up.
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Parse a runtime status string (`"running"`, `"exited"`, ...).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Restarting => write!(f, "restarting"),
            Self::Paused => write!(f, "paused"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Everything the runtime needs to create one gateway container.
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Deterministic container name.
    pub name: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port bindings: container port → host port.
    pub ports: BTreeMap<u16, u16>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Env carries the broker password; print keys only.
        f.debug_struct("ContainerSpec")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("ports", &self.ports)
            .field("labels", &self.labels)
            .finish()
    }
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime API rejected or failed the request.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The container vanished between lookup and use.
    #[error("container not found: {0}")]
    Gone(String),

    /// The runtime did not answer in time.
    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),
}

/// Lookup handle to one container.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Runtime-assigned container id.
    fn id(&self) -> String;

    /// Container name.
    fn name(&self) -> String;

    /// Last status observed by [`reload`](Self::reload) (or at creation).
    fn status(&self) -> ContainerStatus;

    /// Labels the container was created with. Runtimes that cannot report
    /// labels return an empty map, which makes the container unadoptable.
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Refresh the status from the runtime and return it.
    async fn reload(&self) -> Result<ContainerStatus, ContainerError>;

    /// Ask the process to stop, killing it after `timeout`.
    async fn stop(&self, timeout: Duration) -> Result<(), ContainerError>;

    /// Remove the container; `force` kills a running process first.
    async fn remove(&self, force: bool) -> Result<(), ContainerError>;
}

/// Result of a by-name container lookup.
pub enum ContainerLookup {
    /// A container with that name exists.
    Found(Arc<dyn ContainerHandle>),
    /// No container has that name.
    NotFound,
}

impl fmt::Debug for ContainerLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found(handle) => f.debug_tuple("Found").field(&handle.name()).finish(),
            Self::NotFound => write!(f, "NotFound"),
        }
    }
}

/// Container runtime (Docker, Podman, ...).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container.
    async fn run(&self, spec: &ContainerSpec) -> Result<Arc<dyn ContainerHandle>, ContainerError>;

    /// Look a container up by name.
    async fn get(&self, name: &str) -> Result<ContainerLookup, ContainerError>;
}

/// Turn a follower id into a name fragment the runtime accepts
/// (`[a-zA-Z0-9_.-]`, lowercase).
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
