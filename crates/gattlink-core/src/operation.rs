//! Operation identities and their completion payloads.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use gattlink_types::{CharacteristicRef, DescriptorRef, Phy};

use crate::error::{Error, Result};

/// The kinds of request a connection can have outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RequestMtu,
    SetPreferredPhy,
    ReadCharacteristic,
    WriteCharacteristic,
    WriteDescriptor,
    Bond,
}

impl OperationKind {
    /// All kinds, in a stable order.
    pub const ALL: [OperationKind; 6] = [
        OperationKind::RequestMtu,
        OperationKind::SetPreferredPhy,
        OperationKind::ReadCharacteristic,
        OperationKind::WriteCharacteristic,
        OperationKind::WriteDescriptor,
        OperationKind::Bond,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::RequestMtu => "MTU request",
            OperationKind::SetPreferredPhy => "PHY update",
            OperationKind::ReadCharacteristic => "characteristic read",
            OperationKind::WriteCharacteristic => "characteristic write",
            OperationKind::WriteDescriptor => "descriptor write",
            OperationKind::Bond => "bond",
        };
        f.write_str(name)
    }
}

/// Uniquely identifies one outstanding request.
///
/// Attribute operations are keyed by kind and target; link-wide operations
/// use a fixed key per kind, so at most one of each can be pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKey {
    Mtu,
    Phy,
    Bond,
    Read(CharacteristicRef),
    Write(CharacteristicRef),
    WriteDescriptor(DescriptorRef),
}

impl OperationKey {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationKey::Mtu => OperationKind::RequestMtu,
            OperationKey::Phy => OperationKind::SetPreferredPhy,
            OperationKey::Bond => OperationKind::Bond,
            OperationKey::Read(_) => OperationKind::ReadCharacteristic,
            OperationKey::Write(_) => OperationKind::WriteCharacteristic,
            OperationKey::WriteDescriptor(_) => OperationKind::WriteDescriptor,
        }
    }

    /// The attribute this key targets, rendered for error messages.
    pub fn attribute(&self) -> Option<String> {
        match self {
            OperationKey::Read(ch) | OperationKey::Write(ch) => Some(ch.to_string()),
            OperationKey::WriteDescriptor(d) => Some(d.to_string()),
            OperationKey::Mtu | OperationKey::Phy | OperationKey::Bond => None,
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attribute() {
            Some(attribute) => write!(f, "{} on {}", self.kind(), attribute),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Payload delivered with a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    /// A characteristic value.
    Value(Bytes),
    /// A write (characteristic or descriptor) was acknowledged.
    Written,
    /// The negotiated MTU.
    Mtu(u16),
    /// The PHYs in effect after the update.
    Phy { tx: Phy, rx: Phy },
    /// Bonding completed.
    Bonded,
}

impl OperationOutput {
    pub fn into_value(self) -> Result<Bytes> {
        match self {
            OperationOutput::Value(value) => Ok(value),
            other => Err(unexpected("a value", other)),
        }
    }

    pub fn into_written(self) -> Result<()> {
        match self {
            OperationOutput::Written => Ok(()),
            other => Err(unexpected("a write acknowledgement", other)),
        }
    }

    pub fn into_mtu(self) -> Result<u16> {
        match self {
            OperationOutput::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected("an MTU", other)),
        }
    }

    pub fn into_phy(self) -> Result<(Phy, Phy)> {
        match self {
            OperationOutput::Phy { tx, rx } => Ok((tx, rx)),
            other => Err(unexpected("a PHY pair", other)),
        }
    }

    pub fn into_bonded(self) -> Result<()> {
        match self {
            OperationOutput::Bonded => Ok(()),
            other => Err(unexpected("a bond confirmation", other)),
        }
    }
}

fn unexpected(expected: &str, got: OperationOutput) -> Error {
    Error::InvalidData(format!("expected {} completion, got {:?}", expected, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_types::uuids::{BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION};

    #[test]
    fn test_key_kind_and_display() {
        let ch = CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL);
        assert_eq!(OperationKey::Read(ch).kind(), OperationKind::ReadCharacteristic);
        assert!(OperationKey::Write(ch).to_string().starts_with("characteristic write on "));
        assert_eq!(OperationKey::Mtu.to_string(), "MTU request");
        assert_eq!(OperationKey::Mtu.attribute(), None);

        let d = ch.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(OperationKey::WriteDescriptor(d).kind(), OperationKind::WriteDescriptor);
    }

    #[test]
    fn test_keys_distinguish_targets() {
        let a = CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL);
        let b = CharacteristicRef::new(BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_ne!(OperationKey::Read(a), OperationKey::Read(b));
        assert_ne!(OperationKey::Read(a), OperationKey::Write(a));
    }

    #[test]
    fn test_output_unpacking() {
        let value = Bytes::from_static(&[1, 2]);
        assert_eq!(OperationOutput::Value(value.clone()).into_value().unwrap(), value);
        assert_eq!(OperationOutput::Mtu(185).into_mtu().unwrap(), 185);
        assert!(OperationOutput::Written.into_value().is_err());
        assert!(OperationOutput::Bonded.into_bonded().is_ok());
    }
}
