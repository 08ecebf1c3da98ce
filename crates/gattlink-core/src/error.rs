//! Error types for gattlink-core.
//!
//! Every failure a caller can observe is a variant of [`Error`]. Failures
//! reported by the platform never unwind across the callback boundary; they
//! are converted into these values and delivered through the same completion
//! path as a success.
//!
//! # Error Classes
//!
//! | Error | Raised by | Touches connection state? |
//! |-------|-----------|---------------------------|
//! | [`Error::Link`] | link establishment or loss | yes, drives `Error` / reconnect |
//! | [`Error::Discovery`] | attribute enumeration | yes, drives `Error` |
//! | [`Error::Operation`] | read/write/descriptor/MTU/PHY/bond completions | no |
//! | [`Error::AttributeNotFound`] | catalog resolution | no |
//! | [`Error::ConnectionClosed`] | any operation after `close()` | no |
//! | [`Error::DuplicateRequest`] | a second request for a pending key | no |
//! | [`Error::InvalidState`] | operation issued in the wrong state | no |
//!
//! Individual operation failures are local to that call. The connection
//! state stream is the only source of truth for link health.

use std::time::Duration;

use thiserror::Error;

use gattlink_types::{GattStatus, PeerId};

use crate::operation::OperationKind;
use crate::state::ConnectionState;

/// Errors that can occur on an attribute link.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Connection establishment failed or the link was lost.
    #[error("Link error on {peer}: status {status}")]
    Link {
        /// The peer the link belongs to.
        peer: PeerId,
        /// Platform status code.
        status: GattStatus,
    },

    /// Attribute discovery failed.
    #[error("Discovery failed on {peer}: status {status}")]
    Discovery {
        /// The peer being discovered.
        peer: PeerId,
        /// Platform status code.
        status: GattStatus,
    },

    /// A single attribute operation completed with a failure status.
    #[error("{kind} failed{}: status {status}", on_attribute(.attribute))]
    Operation {
        /// The kind of operation.
        kind: OperationKind,
        /// The target attribute, if the operation has one.
        attribute: Option<String>,
        /// Platform status code.
        status: GattStatus,
    },

    /// The (service, characteristic) pair is not in the attribute catalog.
    #[error("Attribute not found: service {service}, characteristic {characteristic}")]
    AttributeNotFound {
        /// The requested service UUID.
        service: String,
        /// The requested characteristic UUID.
        characteristic: String,
    },

    /// The connection has been closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation with the same key is already pending.
    #[error("Duplicate request: {key} is already pending")]
    DuplicateRequest {
        /// The operation key that is already pending.
        key: String,
    },

    /// The operation is not permitted in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the connection was in.
        state: ConnectionState,
    },

    /// The characteristic does not declare the capability the operation needs.
    #[error("Characteristic {attribute} does not support {capability}")]
    NotSupported {
        /// The target characteristic.
        attribute: String,
        /// The missing capability.
        capability: &'static str,
    },

    /// A chunked write aborted partway through.
    #[error("Chunked write aborted at chunk {chunk}/{chunks} (offset {offset}): {source}")]
    ChunkedWrite {
        /// One-based index of the failed chunk.
        chunk: usize,
        /// Total number of chunks planned.
        chunks: usize,
        /// Payload offset of the failed chunk.
        offset: usize,
        /// The failure of that chunk.
        source: Box<Error>,
    },

    /// The platform refused an outbound request synchronously.
    #[error("Platform rejected {request}: {reason}")]
    PlatformRejected {
        /// The rejected request.
        request: &'static str,
        /// Reason given by the platform adapter.
        reason: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid value supplied by the caller or the peer.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Bluetooth stack error surfaced by the btleplug adapter.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

impl Error {
    /// Create an operation failure.
    pub fn operation(kind: OperationKind, attribute: Option<String>, status: GattStatus) -> Self {
        Self::Operation {
            kind,
            attribute,
            status,
        }
    }

    /// Create an attribute-not-found error.
    pub fn attribute_not_found(service: impl ToString, characteristic: impl ToString) -> Self {
        Self::AttributeNotFound {
            service: service.to_string(),
            characteristic: characteristic.to_string(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a platform rejection.
    pub fn rejected(request: &'static str, reason: impl Into<String>) -> Self {
        Self::PlatformRejected {
            request,
            reason: reason.into(),
        }
    }

    /// Whether this error reports a link-level failure rather than a local one.
    pub fn is_link_failure(&self) -> bool {
        match self {
            Error::Link { .. } | Error::Discovery { .. } | Error::Bluetooth(_) => true,
            Error::ChunkedWrite { source, .. } => source.is_link_failure(),
            _ => false,
        }
    }

    /// The platform status carried by this error, if any.
    pub fn status(&self) -> Option<GattStatus> {
        match self {
            Error::Link { status, .. }
            | Error::Discovery { status, .. }
            | Error::Operation { status, .. } => Some(*status),
            Error::ChunkedWrite { source, .. } => source.status(),
            _ => None,
        }
    }
}

fn on_attribute(attribute: &Option<String>) -> String {
    attribute
        .as_ref()
        .map(|a| format!(" on {a}"))
        .unwrap_or_default()
}

impl From<gattlink_types::ParseError> for Error {
    fn from(err: gattlink_types::ParseError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// Result type alias using gattlink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::new("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = Error::Link {
            peer: peer(),
            status: GattStatus::GATT_ERROR,
        };
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));
        assert!(err.to_string().contains("133"));

        let err = Error::operation(
            OperationKind::ReadCharacteristic,
            Some("svc/chr".to_string()),
            GattStatus::READ_NOT_PERMITTED,
        );
        assert_eq!(
            err.to_string(),
            "characteristic read failed on svc/chr: status 2 (READ_NOT_PERMITTED)"
        );

        let err = Error::operation(OperationKind::RequestMtu, None, GattStatus::FAILURE);
        assert_eq!(err.to_string(), "MTU request failed: status 257 (FAILURE)");

        let err = Error::timeout("read", Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::InvalidState {
            operation: "read",
            state: ConnectionState::Connecting,
        };
        assert_eq!(err.to_string(), "Cannot read while connecting");
    }

    #[test]
    fn test_link_failure_classification() {
        let link = Error::Link {
            peer: peer(),
            status: GattStatus::REMOTE_TERMINATED,
        };
        assert!(link.is_link_failure());
        assert_eq!(link.status(), Some(GattStatus::REMOTE_TERMINATED));

        let chunked = Error::ChunkedWrite {
            chunk: 2,
            chunks: 4,
            offset: 182,
            source: Box::new(link),
        };
        assert!(chunked.is_link_failure());
        assert_eq!(chunked.status(), Some(GattStatus::REMOTE_TERMINATED));

        assert!(!Error::ConnectionClosed.is_link_failure());
        assert!(!Error::attribute_not_found("a", "b").is_link_failure());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = gattlink_types::ParseError::UnknownPhy(7).into();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }
}
