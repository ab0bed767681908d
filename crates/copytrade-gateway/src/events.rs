//! Typed events for alerting consumers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::instance::GatewayStatus;
use crate::pool::ResourceKind;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something operators may want to alert on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A gateway was registered for a follower.
    Launched {
        /// Follower id.
        follower_id: String,
        /// Host port assigned.
        host_port: u16,
        /// Client id assigned.
        client_id: u32,
    },
    /// A gateway changed status.
    StatusChanged {
        /// Follower id.
        follower_id: String,
        /// Previous status.
        from: GatewayStatus,
        /// New status.
        to: GatewayStatus,
    },
    /// A gateway was torn down and its resources returned.
    Stopped {
        /// Follower id.
        follower_id: String,
    },
    /// A launch could not reserve a port or client id.
    ResourceExhausted {
        /// Follower whose launch failed.
        follower_id: String,
        /// Pool that ran dry.
        resource: ResourceKind,
    },
    /// The vault stayed unavailable for every attempt.
    CredentialsUnavailable {
        /// Follower whose launch was abandoned.
        follower_id: String,
        /// Last vault error.
        reason: String,
    },
    /// A launch failed for any other reason.
    LaunchFailed {
        /// Follower id.
        follower_id: String,
        /// Failure.
        reason: String,
    },
}

impl GatewayEvent {
    /// Follower the event is about.
    #[must_use]
    pub fn follower_id(&self) -> &str {
        match self {
            Self::Launched { follower_id, .. }
            | Self::StatusChanged { follower_id, .. }
            | Self::Stopped { follower_id }
            | Self::ResourceExhausted { follower_id, .. }
            | Self::CredentialsUnavailable { follower_id, .. }
            | Self::LaunchFailed { follower_id, .. } => follower_id,
        }
    }
}

/// Cloneable sending side of the event channel.
///
/// Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventSink {
    /// Create a sink with room for `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event.
    pub fn emit(&self, event: GatewayEvent) {
        if self.tx.send(event).is_err() {
            trace!("gateway event dropped: no subscribers");
        }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();

        sink.emit(GatewayEvent::Stopped {
            follower_id: "f-1".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.follower_id(), "f-1");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let sink = EventSink::new(4);
        sink.emit(GatewayEvent::LaunchFailed {
            follower_id: "f-1".into(),
            reason: "boom".into(),
        });
    }

    #[test]
    fn events_serialize_tagged() {
        let event = GatewayEvent::ResourceExhausted {
            follower_id: "f-9".into(),
            resource: ResourceKind::ClientId,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "resource_exhausted");
        assert_eq!(json["resource"], "client_id");
    }
}
