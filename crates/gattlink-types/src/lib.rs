//! Platform-agnostic types for GATT-style attribute links.
//!
//! This crate provides the shared data model used by the connection layer
//! (gattlink-core) and by any platform adapter feeding it events.
//!
//! # Features
//!
//! - Peer identity with hardware-address normalization
//! - The discovered attribute tree (services, characteristics, descriptors)
//!   and its layout fingerprint
//! - Platform status codes, PHY identifiers, capability flags
//! - Well-known attribute UUIDs
//!
//! # Example
//!
//! ```
//! use gattlink_types::{AttributeCatalog, CharacteristicProperties, GattCharacteristic, GattService, PeerId};
//! use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
//!
//! let peer: PeerId = "aa:bb:cc:dd:ee:ff".parse().unwrap();
//! let service = GattService::new(BATTERY_SERVICE).with_characteristic(
//!     GattCharacteristic::new(BATTERY_LEVEL, CharacteristicProperties::from_bits(0x12)),
//! );
//! let catalog = AttributeCatalog::new(peer, vec![service]);
//! assert!(catalog.characteristic(&BATTERY_SERVICE, &BATTERY_LEVEL).is_some());
//! ```

pub mod error;
pub mod status;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use status::GattStatus;
pub use types::{
    ATT_WRITE_HEADER_LEN, AttributeCatalog, CharacteristicProperties, CharacteristicRef,
    DEFAULT_ATT_MTU, DISABLE_NOTIFICATION_VALUE, DescriptorRef, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE, GattCharacteristic, GattDescriptor, GattService, MAX_ATT_MTU,
    PeerId, Phy, PhyOptions,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::{
        BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION, DEVICE_NAME,
        GAP_SERVICE,
    };

    fn battery_service() -> GattService {
        GattService::new(BATTERY_SERVICE).with_characteristic(
            GattCharacteristic::new(BATTERY_LEVEL, CharacteristicProperties::from_bits(0x12))
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
        )
    }

    fn gap_service() -> GattService {
        GattService::new(GAP_SERVICE).with_characteristic(GattCharacteristic::new(
            DEVICE_NAME,
            CharacteristicProperties::from_bits(0x02),
        ))
    }

    // --- PeerId tests ---

    #[test]
    fn test_peer_id_normalizes_hardware_address() {
        let peer = PeerId::new("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(peer.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(peer.is_hardware_address());
        assert_eq!(peer, "AA:BB:CC:DD:EE:FF".parse::<PeerId>().unwrap());
    }

    #[test]
    fn test_peer_id_keeps_platform_uuid() {
        let peer = PeerId::new("6f0b3c52-3b6e-4a3c-9d0e-8f1f6c2a9b10").unwrap();
        assert!(!peer.is_hardware_address());
        assert_eq!(peer.to_string(), "6f0b3c52-3b6e-4a3c-9d0e-8f1f6c2a9b10");
    }

    #[test]
    fn test_peer_id_rejects_empty_and_whitespace() {
        assert!(matches!(PeerId::new(""), Err(ParseError::InvalidPeerId(_))));
        assert!(matches!(PeerId::new("   "), Err(ParseError::InvalidPeerId(_))));
        assert!(matches!(PeerId::new("AA BB"), Err(ParseError::InvalidPeerId(_))));
    }

    // --- Capability flag tests ---

    #[test]
    fn test_properties_bits_round_trip() {
        for bits in [0x00u8, 0x02, 0x0A, 0x12, 0x3E, 0xFF] {
            assert_eq!(CharacteristicProperties::from_bits(bits).bits(), bits);
        }
    }

    #[test]
    fn test_properties_helpers() {
        let props = CharacteristicProperties::from_bits(0x12);
        assert!(props.read);
        assert!(props.notify);
        assert!(props.can_notify());
        assert!(!props.is_writable());

        let props = CharacteristicProperties::from_bits(0x24);
        assert!(props.write_without_response);
        assert!(props.indicate);
        assert!(props.is_writable());
    }

    #[test]
    fn test_phy_from_code() {
        assert_eq!(Phy::try_from(2).unwrap(), Phy::Le2M);
        assert_eq!(Phy::try_from(9).unwrap_err(), ParseError::UnknownPhy(9));
    }

    // --- AttributeCatalog tests ---

    #[test]
    fn test_catalog_lookup() {
        let peer = PeerId::new("AA:BB:CC:DD:EE:FF").unwrap();
        let catalog = AttributeCatalog::new(peer.clone(), vec![battery_service(), gap_service()]);

        assert_eq!(catalog.peer(), &peer);
        assert_eq!(catalog.services().len(), 2);
        assert_eq!(catalog.characteristic_count(), 2);

        let battery = catalog
            .characteristic(&BATTERY_SERVICE, &BATTERY_LEVEL)
            .unwrap();
        assert!(battery.descriptor(&CLIENT_CHARACTERISTIC_CONFIGURATION).is_some());
        assert!(catalog.characteristic(&GAP_SERVICE, &BATTERY_LEVEL).is_none());
    }

    #[test]
    fn test_catalog_fingerprint_ignores_discovery_order() {
        let peer = PeerId::new("AA:BB:CC:DD:EE:FF").unwrap();
        let a = AttributeCatalog::new(peer.clone(), vec![battery_service(), gap_service()]);
        let b = AttributeCatalog::new(peer, vec![gap_service(), battery_service()]);
        assert!(a.has_same_layout(&b));
    }

    #[test]
    fn test_catalog_fingerprint_detects_layout_change() {
        let peer = PeerId::new("AA:BB:CC:DD:EE:FF").unwrap();
        let a = AttributeCatalog::new(peer.clone(), vec![battery_service()]);

        let mut changed = battery_service();
        changed.characteristics[0].properties = CharacteristicProperties::from_bits(0x02);
        let b = AttributeCatalog::new(peer, vec![changed]);

        assert!(!a.has_same_layout(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_references_display() {
        let ch = CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL);
        let display = ch.to_string();
        assert!(display.contains("0000180f"));
        assert!(display.contains("00002a19"));

        let desc = ch.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert!(desc.to_string().ends_with("00002902-0000-1000-8000-00805f9b34fb"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_catalog_serde_round_trip() {
        let peer = PeerId::new("AA:BB:CC:DD:EE:FF").unwrap();
        let catalog = AttributeCatalog::new(peer, vec![battery_service()]);

        let json = serde_json::to_string(&catalog).unwrap();
        let decoded: AttributeCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, catalog);
        assert!(decoded.has_same_layout(&catalog));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_peer_id_serde_validates() {
        let result: Result<PeerId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
        let peer: PeerId = serde_json::from_str("\"aa:bb:cc:dd:ee:ff\"").unwrap();
        assert_eq!(peer.as_str(), "AA:BB:CC:DD:EE:FF");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Decoding any properties byte and re-encoding it is lossless.
        #[test]
        fn properties_bits_are_lossless(bits: u8) {
            prop_assert_eq!(CharacteristicProperties::from_bits(bits).bits(), bits);
        }

        /// Any 16-bit assigned number survives expansion to a full UUID.
        #[test]
        fn short_uuid_expansion_is_reversible(short: u16) {
            prop_assert_eq!(crate::uuid::to_u16(&crate::uuid::from_u16(short)), Some(short));
        }

        /// PeerId construction never panics on arbitrary input.
        #[test]
        fn peer_id_never_panics(input: String) {
            let _ = PeerId::new(&input);
        }
    }
}
