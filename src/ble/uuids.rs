//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identifiers used to find and talk to the sensor peripheral.
//! The 16-bit values must stay exactly as they are for wire compatibility
//! with the firmware.

use uuid::Uuid;

/// Bluetooth SIG base UUID with the 16-bit slot zeroed.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit SIG short UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Advertised local name of the target sensor (exact, case-sensitive match).
pub const TARGET_LOCAL_NAME: &str = "shitmeter";

// Environmental Sensing Service (Standard BLE)
/// Environmental Sensing service UUID (0x181A).
pub const ENVIRONMENTAL_SENSING_SERVICE_UUID: Uuid = uuid_from_u16(0x181a);
/// Temperature characteristic UUID (0x2A6E).
pub const TEMPERATURE_UUID: Uuid = uuid_from_u16(0x2a6e);
/// Pressure characteristic UUID (0x2A6D).
pub const PRESSURE_UUID: Uuid = uuid_from_u16(0x2a6d);
/// Humidity characteristic UUID (0x2A6F).
pub const HUMIDITY_UUID: Uuid = uuid_from_u16(0x2a6f);

// Vendor extension
/// CO2 concentration characteristic UUID (0x2A70, non-standard use of the slot).
pub const CO2_UUID: Uuid = uuid_from_u16(0x2a70);

/// All sensor characteristic UUIDs.
pub const CHARACTERISTIC_UUIDS: [Uuid; 4] =
    [TEMPERATURE_UUID, PRESSURE_UUID, HUMIDITY_UUID, CO2_UUID];

/// Check if a service UUID is the Environmental Sensing service.
pub fn is_environmental_service(uuid: &Uuid) -> bool {
    *uuid == ENVIRONMENTAL_SENSING_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            ENVIRONMENTAL_SENSING_SERVICE_UUID.to_string(),
            "0000181a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CO2_UUID.to_string(),
            "00002a70-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_short_uuids() {
        assert_eq!(TEMPERATURE_UUID, uuid_from_u16(0x2A6E));
        assert_eq!(PRESSURE_UUID, uuid_from_u16(0x2A6D));
        assert_eq!(HUMIDITY_UUID, uuid_from_u16(0x2A6F));
    }

    #[test]
    fn test_is_environmental_service() {
        assert!(is_environmental_service(&ENVIRONMENTAL_SENSING_SERVICE_UUID));
        assert!(!is_environmental_service(&TEMPERATURE_UUID));
        assert!(!is_environmental_service(&uuid_from_u16(0x180a)));
    }
}
