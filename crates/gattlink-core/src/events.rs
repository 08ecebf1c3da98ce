//! Connection event system.
//!
//! State changes are published on a `watch` channel (last value retained).
//! Everything else a connection wants to tell observers about, such as
//! reconnect decisions, catalog updates and failed operations, goes out as a
//! [`ConnectionEvent`] on a broadcast channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use gattlink_types::{GattStatus, PeerId};

use crate::cache::CatalogUpdate;
use crate::state::ConnectionState;

/// Events emitted by a connection.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The transport went down.
    Disconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        peer: PeerId,
        attempt: u32,
        delay_ms: u64,
        cause: String,
    },
    /// A scheduled reconnect attempt fired.
    ReconnectStarted { peer: PeerId, attempt: u32 },
    /// The reconnect budget is spent; no further attempts will be made.
    ReconnectExhausted { peer: PeerId, attempts: u32 },
    /// A discovery result was stored in the catalog cache.
    CatalogUpdated {
        peer: PeerId,
        update: CatalogUpdate,
        characteristics: usize,
    },
    /// The cached catalog for the peer was dropped.
    CatalogInvalidated { peer: PeerId },
    /// An operation completed with an error.
    OperationFailed {
        peer: PeerId,
        operation: String,
        error: String,
    },
}

impl ConnectionEvent {
    /// The peer the event belongs to.
    pub fn peer(&self) -> &PeerId {
        match self {
            ConnectionEvent::StateChanged { peer, .. }
            | ConnectionEvent::Disconnected { peer, .. }
            | ConnectionEvent::ReconnectScheduled { peer, .. }
            | ConnectionEvent::ReconnectStarted { peer, .. }
            | ConnectionEvent::ReconnectExhausted { peer, .. }
            | ConnectionEvent::CatalogUpdated { peer, .. }
            | ConnectionEvent::CatalogInvalidated { peer }
            | ConnectionEvent::OperationFailed { peer, .. } => peer,
        }
    }
}

/// Why the transport went down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    UserRequested,
    /// `close()` was called.
    Closed,
    /// The link dropped or failed with the given platform status.
    LinkLost(GattStatus),
}

/// Sender for connection events.
pub type EventSender = broadcast::Sender<ConnectionEvent>;

/// Receiver for connection events.
pub type EventReceiver = broadcast::Receiver<ConnectionEvent>;

/// Fan-out of connection events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: ConnectionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::new("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_to_subscribers() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        dispatcher.send(ConnectionEvent::CatalogInvalidated { peer: peer() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer(), &peer());
    }

    #[test]
    fn test_send_without_subscribers_is_silent() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.receiver_count(), 0);
        dispatcher.send(ConnectionEvent::ReconnectStarted {
            peer: peer(),
            attempt: 1,
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = ConnectionEvent::Disconnected {
            peer: peer(),
            reason: DisconnectReason::LinkLost(GattStatus::REMOTE_TERMINATED),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"disconnected""#));
        assert!(json.contains(r#""peer":"AA:BB:CC:DD:EE:FF""#));

        let back: ConnectionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
