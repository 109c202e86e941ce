//! Environmental Sensing characteristic table.
//!
//! Each [`ReadingKind`] maps to exactly one [`CharacteristicSpec`] describing
//! how its raw GATT value is interpreted. Adding a sensor is a table change.

use std::fmt;
use uuid::Uuid;

use crate::ble::uuids::{CO2_UUID, HUMIDITY_UUID, PRESSURE_UUID, TEMPERATURE_UUID};

/// The kinds of readings the sensor publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReadingKind {
    /// Air temperature in degrees Celsius.
    Temperature,
    /// Barometric pressure in hectopascals.
    Pressure,
    /// Relative humidity in percent.
    Humidity,
    /// CO2 concentration in parts per million.
    Co2,
}

impl ReadingKind {
    /// All kinds, in table order.
    pub const ALL: [ReadingKind; 4] = [
        ReadingKind::Temperature,
        ReadingKind::Pressure,
        ReadingKind::Humidity,
        ReadingKind::Co2,
    ];

    /// Unit suffix for display.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Pressure => "hPa",
            Self::Humidity => "%",
            Self::Co2 => "ppm",
        }
    }

    /// The characteristic spec for this kind.
    pub fn spec(&self) -> &'static CharacteristicSpec {
        // Every kind has a table row; see test_table_covers_every_kind.
        &CHARACTERISTIC_SPECS[*self as usize]
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature => write!(f, "Temperature"),
            Self::Pressure => write!(f, "Pressure"),
            Self::Humidity => write!(f, "Humidity"),
            Self::Co2 => write!(f, "CO2"),
        }
    }
}

/// Integer width and signedness of a raw characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawWidth {
    /// 16-bit signed.
    I16,
    /// 16-bit unsigned.
    U16,
    /// 32-bit unsigned.
    U32,
}

impl RawWidth {
    /// Number of bytes occupied by a value of this width.
    pub const fn byte_len(&self) -> usize {
        match self {
            Self::I16 | Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Byte order used to assemble raw integers from characteristic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// Least significant byte first (GATT convention, and what the firmware writes).
    #[default]
    LittleEndian,
    /// Most significant byte first.
    BigEndian,
}

/// How to interpret one characteristic's raw value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacteristicSpec {
    /// Which reading this characteristic carries.
    pub kind: ReadingKind,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Raw integer is divided by this to get the physical value.
    pub divisor: f64,
    /// Raw value meaning "no reading".
    pub sentinel: i64,
    /// Width of the raw integer.
    pub width: RawWidth,
    /// Byte order of the raw integer.
    pub byte_order: ByteOrder,
}

impl CharacteristicSpec {
    /// Copy of this spec decoded with a different byte order.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }
}

/// The characteristic table, indexed by `ReadingKind as usize`.
pub static CHARACTERISTIC_SPECS: [CharacteristicSpec; 4] = [
    CharacteristicSpec {
        kind: ReadingKind::Temperature,
        uuid: TEMPERATURE_UUID,
        divisor: 100.0,
        sentinel: i16::MAX as i64,
        width: RawWidth::I16,
        byte_order: ByteOrder::LittleEndian,
    },
    CharacteristicSpec {
        kind: ReadingKind::Pressure,
        uuid: PRESSURE_UUID,
        divisor: 10.0,
        sentinel: u32::MAX as i64,
        width: RawWidth::U32,
        byte_order: ByteOrder::LittleEndian,
    },
    CharacteristicSpec {
        kind: ReadingKind::Humidity,
        uuid: HUMIDITY_UUID,
        divisor: 100.0,
        sentinel: u16::MAX as i64,
        width: RawWidth::U16,
        byte_order: ByteOrder::LittleEndian,
    },
    CharacteristicSpec {
        kind: ReadingKind::Co2,
        uuid: CO2_UUID,
        divisor: 1.0,
        sentinel: u16::MAX as i64,
        width: RawWidth::U16,
        byte_order: ByteOrder::LittleEndian,
    },
];

/// Look up the table row for a characteristic UUID.
pub fn spec_for_uuid(uuid: &Uuid) -> Option<&'static CharacteristicSpec> {
    CHARACTERISTIC_SPECS.iter().find(|spec| spec.uuid == *uuid)
}

/// Check if a characteristic carries one of the sensor readings.
pub fn is_sensor_characteristic(uuid: &Uuid) -> bool {
    spec_for_uuid(uuid).is_some()
}
