//! Broker session establishment with bounded retries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, RetryOutcome, retry_with_cancel};
use crate::broker::{BrokerClient, BrokerConnector, BrokerError};
use crate::error::{GatewayError, GatewayResult};
use crate::instance::GatewayInstance;

/// Coarse classification of a failed connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The attempt hit the connect timeout.
    Timeout,
    /// Nothing listening on the port yet.
    Refused,
    /// The gateway rejected the session.
    Rejected,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Classify a broker error.
    #[must_use]
    pub fn of(error: &BrokerError) -> Self {
        match error {
            BrokerError::Timeout(_) => Self::Timeout,
            BrokerError::Refused(_) => Self::Refused,
            BrokerError::Rejected(_) => Self::Rejected,
            BrokerError::Disconnected | BrokerError::Other(_) => Self::Other,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Refused => write!(f, "refused"),
            Self::Rejected => write!(f, "rejected"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Establishes broker sessions for gateway instances.
///
/// Does not change instance status; callers decide what a success or failure
/// means for the state machine.
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    host: String,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    /// Create a supervisor connecting to gateways published on `host`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        host: impl Into<String>,
        policy: BackoffPolicy,
        attempt_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            host: host.into(),
            policy,
            attempt_timeout,
            shutdown,
        }
    }

    /// The configured retry policy.
    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Connect with the configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionFailed`] once every attempt failed.
    pub async fn connect(&self, instance: &GatewayInstance) -> GatewayResult<Arc<dyn BrokerClient>> {
        self.connect_with_policy(instance, &self.policy).await
    }

    /// Connect with an explicit policy.
    ///
    /// Attempts against one instance are serialised, so a health sweep and a
    /// consumer-triggered reconnect never race each other. The new session is
    /// stored on the instance and any session it replaces is closed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionFailed`] once every attempt failed,
    /// if shutdown interrupted the retries, or if the instance was stopped
    /// while connecting.
    pub async fn connect_with_policy(
        &self,
        instance: &GatewayInstance,
        policy: &BackoffPolicy,
    ) -> GatewayResult<Arc<dyn BrokerClient>> {
        let _guard = instance.connect_guard().await;
        let follower_id = instance.follower_id();

        // Another caller may have connected while we waited on the guard.
        if let Some(client) = instance.connected_client().await {
            return Ok(client);
        }

        let endpoint = instance.endpoint(&self.host);
        let timeout = self.attempt_timeout;

        let outcome = retry_with_cancel(policy, &self.shutdown, |attempt| {
            let connector = Arc::clone(&self.connector);
            let endpoint = endpoint.clone();
            async move {
                debug!(%follower_id, attempt, %endpoint, "Connecting to broker API");
                let result = match tokio::time::timeout(timeout, connector.connect(&endpoint, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::Timeout(timeout)),
                };
                if let Err(e) = &result {
                    warn!(
                        %follower_id,
                        attempt,
                        kind = %FailureKind::of(e),
                        error = %e,
                        "Broker connect attempt failed"
                    );
                }
                result
            }
        })
        .await;

        let (client, attempts) = match outcome {
            RetryOutcome::Success { value, attempts } => (value, attempts),
            RetryOutcome::Exhausted { error: e, attempts } => {
                return Err(GatewayError::ConnectionFailed {
                    follower_id: follower_id.to_string(),
                    attempts,
                    reason: format!("{}: {e}", FailureKind::of(&e)),
                });
            },
            RetryOutcome::Aborted { attempts } => {
                return Err(GatewayError::ConnectionFailed {
                    follower_id: follower_id.to_string(),
                    attempts,
                    reason: "shutdown in progress".into(),
                });
            },
        };

        match instance.attach_client(Arc::clone(&client)).await {
            Ok(replaced) => {
                if let Some(stale) = replaced {
                    close_quietly(follower_id, stale.as_ref()).await;
                }
                info!(
                    %follower_id,
                    attempts,
                    host_port = instance.host_port(),
                    client_id = instance.client_id(),
                    "Broker session established"
                );
                Ok(client)
            },
            Err(rejected) => {
                close_quietly(follower_id, rejected.as_ref()).await;
                Err(GatewayError::ConnectionFailed {
                    follower_id: follower_id.to_string(),
                    attempts,
                    reason: "gateway stopped while connecting".into(),
                })
            },
        }
    }
}

/// Close a session, logging instead of failing.
pub(crate) async fn close_quietly(follower_id: &str, client: &dyn BrokerClient) {
    if let Err(e) = client.disconnect().await {
        debug!(%follower_id, error = %e, "Ignoring disconnect error");
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("host", &self.host)
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}
