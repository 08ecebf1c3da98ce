//! Error types for data parsing in gattlink-types.

use thiserror::Error;

/// Errors that can occur when parsing attribute-protocol values.
///
/// This error type is platform-agnostic and does not include link or
/// operation errors (those belong in gattlink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The peer identifier is empty or contains characters no platform uses.
    #[error("Invalid peer identifier: {0:?}")]
    InvalidPeerId(String),

    /// Unknown PHY code.
    #[error("Unknown PHY code: {0}")]
    UnknownPhy(u8),

    /// A descriptor value had the wrong length.
    #[error("Invalid descriptor value: expected {expected} bytes, got {actual}")]
    InvalidDescriptorValue {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },
}

/// Result type alias using gattlink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
