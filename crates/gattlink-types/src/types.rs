//! Core types for the attribute model of a remote peripheral.

use core::fmt;
use core::str::FromStr;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ParseError;

/// Default ATT MTU before any negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest ATT MTU a peer may negotiate.
pub const MAX_ATT_MTU: u16 = 517;

/// Per-request header of an ATT write (opcode + attribute handle).
pub const ATT_WRITE_HEADER_LEN: usize = 3;

/// CCCD value that enables notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value that enables indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value that disables both notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Stable identity of a remote peripheral.
///
/// On Linux and Windows this is the Bluetooth hardware address
/// (`AA:BB:CC:DD:EE:FF`); on macOS the platform exposes a per-host UUID
/// instead. Hardware addresses are normalized to upper case so that the
/// same peer always maps to the same cache and reconnect key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identity, validating and normalizing it.
    pub fn new(id: impl AsRef<str>) -> Result<Self, ParseError> {
        let trimmed = id.as_ref().trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidPeerId(id.as_ref().to_string()));
        }
        if is_hardware_address(trimmed) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identity is a 48-bit hardware address.
    #[must_use]
    pub fn is_hardware_address(&self) -> bool {
        is_hardware_address(&self.0)
    }
}

fn is_hardware_address(s: &str) -> bool {
    let octets: Vec<&str> = s.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

/// Physical layer used by the radio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Phy {
    /// 1 Mbit/s (always available).
    Le1M = 1,
    /// 2 Mbit/s.
    Le2M = 2,
    /// Coded PHY (long range).
    LeCoded = 3,
}

impl TryFrom<u8> for Phy {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Phy::Le1M),
            2 => Ok(Phy::Le2M),
            3 => Ok(Phy::LeCoded),
            other => Err(ParseError::UnknownPhy(other)),
        }
    }
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phy::Le1M => write!(f, "LE 1M"),
            Phy::Le2M => write!(f, "LE 2M"),
            Phy::LeCoded => write!(f, "LE Coded"),
        }
    }
}

/// Coding preference when requesting [`Phy::LeCoded`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PhyOptions {
    /// Let the controller choose.
    #[default]
    NoPreference,
    /// Prefer S=2 coding.
    S2,
    /// Prefer S=8 coding.
    S8,
}

/// Capability flags of a characteristic, as declared by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
}

impl CharacteristicProperties {
    /// Decode the properties byte of a characteristic declaration.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            broadcast: bits & 0x01 != 0,
            read: bits & 0x02 != 0,
            write_without_response: bits & 0x04 != 0,
            write: bits & 0x08 != 0,
            notify: bits & 0x10 != 0,
            indicate: bits & 0x20 != 0,
            authenticated_signed_writes: bits & 0x40 != 0,
            extended_properties: bits & 0x80 != 0,
        }
    }

    /// Encode back into the declaration byte.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        (self.broadcast as u8)
            | (self.read as u8) << 1
            | (self.write_without_response as u8) << 2
            | (self.write as u8) << 3
            | (self.notify as u8) << 4
            | (self.indicate as u8) << 5
            | (self.authenticated_signed_writes as u8) << 6
            | (self.extended_properties as u8) << 7
    }

    /// Whether the value can be written in any mode.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Whether the peer can push values (notify or indicate).
    #[must_use]
    pub const fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A descriptor attached to a characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattDescriptor {
    pub uuid: Uuid,
}

/// A characteristic discovered on the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    #[cfg_attr(feature = "serde", serde(default))]
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    /// Create a characteristic with no descriptors.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(GattDescriptor { uuid });
        self
    }

    /// Look up a descriptor by UUID.
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }
}

/// A service discovered on the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattService {
    pub uuid: Uuid,
    pub primary: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Create a primary service with no characteristics.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic.
    #[must_use]
    pub fn with_characteristic(mut self, characteristic: GattCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Look up a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Identifies one characteristic by its (service, characteristic) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Reference a descriptor of this characteristic.
    pub const fn descriptor(self, descriptor: Uuid) -> DescriptorRef {
        DescriptorRef {
            characteristic: self,
            descriptor,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Identifies one descriptor of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DescriptorRef {
    pub characteristic: CharacteristicRef,
    pub descriptor: Uuid,
}

impl fmt::Display for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.characteristic, self.descriptor)
    }
}

/// The discovered attribute tree of one peer.
///
/// Immutable once built. The fingerprint summarizes the layout (UUIDs,
/// capability flags and descriptors, independent of discovery order) so two
/// discoveries of the same peer can be compared cheaply.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AttributeCatalog {
    peer: PeerId,
    services: Vec<GattService>,
    fingerprint: u64,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    discovered_at: OffsetDateTime,
}

impl AttributeCatalog {
    /// Build a catalog from a fresh discovery result.
    pub fn new(peer: PeerId, services: Vec<GattService>) -> Self {
        let fingerprint = layout_fingerprint(&services);
        Self {
            peer,
            services,
            fingerprint,
            discovered_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// When the discovery that produced this catalog completed.
    pub fn discovered_at(&self) -> OffsetDateTime {
        self.discovered_at
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    /// Resolve a (service, characteristic) pair.
    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<&GattCharacteristic> {
        self.service(service)?.characteristic(characteristic)
    }

    /// Total number of characteristics across all services.
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// Whether `other` describes the same attribute layout.
    pub fn has_same_layout(&self, other: &AttributeCatalog) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl PartialEq for AttributeCatalog {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.services == other.services
    }
}

impl Eq for AttributeCatalog {}

fn layout_fingerprint(services: &[GattService]) -> u64 {
    let mut services: Vec<&GattService> = services.iter().collect();
    services.sort_by_key(|s| s.uuid);

    let mut hasher = DefaultHasher::new();
    for service in services {
        service.uuid.hash(&mut hasher);
        service.primary.hash(&mut hasher);

        let mut characteristics: Vec<&GattCharacteristic> = service.characteristics.iter().collect();
        characteristics.sort_by_key(|c| c.uuid);
        for characteristic in characteristics {
            characteristic.uuid.hash(&mut hasher);
            characteristic.properties.bits().hash(&mut hasher);

            let mut descriptors: Vec<&GattDescriptor> = characteristic.descriptors.iter().collect();
            descriptors.sort();
            descriptors.hash(&mut hasher);
        }
    }
    hasher.finish()
}
