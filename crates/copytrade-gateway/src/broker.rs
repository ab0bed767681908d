//! Broker API interface.
//!
//! A [`BrokerConnector`] builds a session bound to one gateway endpoint; the
//! resulting [`BrokerClient`] is the handle consumers trade through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Where a gateway's broker API listens, and which client id to log in with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    /// Host the container port is published on.
    pub host: String,
    /// Published host port.
    pub port: u16,
    /// API client id, unique across the fleet.
    pub client_id: u32,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (client {})", self.host, self.port, self.client_id)
    }
}

/// Errors from the broker API client.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Nothing accepted the TCP connection.
    #[error("connection refused by {0}")]
    Refused(String),

    /// The API handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The gateway accepted the socket but rejected the session
    /// (client id in use, not logged in, ...).
    #[error("session rejected: {0}")]
    Rejected(String),

    /// The session dropped.
    #[error("disconnected")]
    Disconnected,

    /// Anything else.
    #[error("broker api error: {0}")]
    Other(String),
}

/// A live broker API session.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Whether the session is currently connected.
    fn is_connected(&self) -> bool;

    /// Close the session.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Accounts the logged-in user can trade.
    fn managed_accounts(&self) -> Vec<String>;
}

/// Factory for broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a session against `endpoint`. Each call is a fresh attempt.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        timeout: Duration,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}
