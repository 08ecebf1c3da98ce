//! Well-known attribute UUIDs.
//!
//! Only the identifiers the connection layer itself needs are listed here;
//! application profiles define their own.

use uuid::{Uuid, uuid};

/// The Bluetooth base UUID that 16-bit assigned numbers expand into.
pub const BLUETOOTH_BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

// --- Standard Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Generic Attribute Profile (GATT) service.
pub const GATT_SERVICE: Uuid = uuid!("00001801-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Standard Characteristic UUIDs ---

/// Device name (GAP).
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");

/// Service Changed indication (GATT).
pub const SERVICE_CHANGED: Uuid = uuid!("00002a05-0000-1000-8000-00805f9b34fb");

/// Battery level.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Standard Descriptor UUIDs ---

/// Client Characteristic Configuration descriptor (CCCD).
///
/// Writing this descriptor switches notification or indication delivery
/// on the peer.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid =
    uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// Expand a 16-bit assigned number into a full UUID.
#[must_use]
pub const fn from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit assigned number if `uuid` is derived from the base UUID.
#[must_use]
pub fn to_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xFFFF_FFFFu128 << 96);
    if value & mask != BLUETOOTH_BASE_UUID.as_u128() {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_matches_constants() {
        assert_eq!(from_u16(0x2902), CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(from_u16(0x180f), BATTERY_SERVICE);
        assert_eq!(from_u16(0x2a19), BATTERY_LEVEL);
    }

    #[test]
    fn test_to_u16() {
        assert_eq!(to_u16(&DEVICE_NAME), Some(0x2a00));
        let custom = uuid!("f0cd3001-95da-4f4b-9ac8-aa55d312af0c");
        assert_eq!(to_u16(&custom), None);
    }
}
