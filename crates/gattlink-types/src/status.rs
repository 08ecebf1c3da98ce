//! Platform status codes reported with link and attribute events.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A numeric status code reported by the platform with every completion.
///
/// The values follow the codes Bluetooth stacks commonly surface (ATT error
/// codes in the low range, HCI disconnect reasons, and the catch-all `133`).
/// Unknown codes are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct GattStatus(pub u16);

impl GattStatus {
    /// Operation completed successfully.
    pub const SUCCESS: Self = Self(0x00);
    /// The attribute cannot be read.
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    /// The attribute cannot be written.
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    /// Authentication is required.
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    /// The request is not supported by the peer or the platform.
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    /// The offset of a long write was invalid.
    pub const INVALID_OFFSET: Self = Self(0x07);
    /// Supervision timeout expired.
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);
    /// The attribute value length is invalid for the operation.
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(0x0D);
    /// Encryption is required.
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x0F);
    /// The remote peer terminated the connection.
    pub const REMOTE_TERMINATED: Self = Self(0x13);
    /// The local host terminated the connection.
    pub const LOCAL_TERMINATED: Self = Self(0x16);
    /// Generic stack error, frequently seen on connection establishment.
    pub const GATT_ERROR: Self = Self(0x85);
    /// Too many outstanding requests on the link.
    pub const CONNECTION_CONGESTED: Self = Self(0x8F);
    /// Generic failure.
    pub const FAILURE: Self = Self(0x101);

    /// Whether this status reports success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// The raw numeric code.
    #[must_use]
    pub const fn code(self) -> u16 {
        self.0
    }

    /// Symbolic name for well-known codes.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "SUCCESS",
            Self::READ_NOT_PERMITTED => "READ_NOT_PERMITTED",
            Self::WRITE_NOT_PERMITTED => "WRITE_NOT_PERMITTED",
            Self::INSUFFICIENT_AUTHENTICATION => "INSUFFICIENT_AUTHENTICATION",
            Self::REQUEST_NOT_SUPPORTED => "REQUEST_NOT_SUPPORTED",
            Self::INVALID_OFFSET => "INVALID_OFFSET",
            Self::CONNECTION_TIMEOUT => "CONNECTION_TIMEOUT",
            Self::INVALID_ATTRIBUTE_LENGTH => "INVALID_ATTRIBUTE_LENGTH",
            Self::INSUFFICIENT_ENCRYPTION => "INSUFFICIENT_ENCRYPTION",
            Self::REMOTE_TERMINATED => "REMOTE_TERMINATED",
            Self::LOCAL_TERMINATED => "LOCAL_TERMINATED",
            Self::GATT_ERROR => "GATT_ERROR",
            Self::CONNECTION_CONGESTED => "CONNECTION_CONGESTED",
            Self::FAILURE => "FAILURE",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u16> for GattStatus {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(GattStatus::GATT_ERROR.to_string(), "133 (GATT_ERROR)");
        assert_eq!(GattStatus(0x4242).to_string(), "16962");
    }

    #[test]
    fn test_success() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(GattStatus::from(0).is_success());
        assert!(!GattStatus::FAILURE.is_success());
    }
}
