//! Connection states and the transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one connection.
///
/// Exactly one variant holds at any instant. The state is owned by the
/// [`ConnectionStateMachine`](crate::ConnectionStateMachine); everything else
/// observes it through a state stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// A platform connect call is outstanding.
    Connecting,
    /// Transport established, attributes not yet known.
    Connected,
    /// Attribute discovery is running.
    DiscoveringAttributes,
    /// Attributes known, operations permitted.
    Ready,
    /// The link or discovery failed. Recoverable by a later `connect()`.
    Error(String),
}

impl ConnectionState {
    /// Whether attribute operations are permitted.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Whether a transport is established (Connected, DiscoveringAttributes or Ready).
    pub fn has_transport(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::DiscoveringAttributes
                | ConnectionState::Ready
        )
    }

    /// Whether `connect()` should be a no-op in this state.
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(self, ConnectionState::Connecting) || self.has_transport()
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error(_))
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// `Disconnected` and `Error` are reachable from every state (close,
    /// link loss, internal fault). The remaining edges are:
    ///
    /// ```text
    /// Disconnected | Error          -> Connecting
    /// Connecting                    -> Connected
    /// Connected                     -> DiscoveringAttributes | Ready (cached catalog)
    /// DiscoveringAttributes         -> Ready
    /// Ready                         -> DiscoveringAttributes (rediscovery)
    /// ```
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) | (_, Error(_)) => true,
            (Disconnected | Error(_), Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, DiscoveringAttributes) | (Connected, Ready) => true,
            (DiscoveringAttributes, Ready) => true,
            (Ready, DiscoveringAttributes) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::DiscoveringAttributes => write!(f, "discovering attributes"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Transport state reported by the platform with a link-state event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Disconnected,
}
