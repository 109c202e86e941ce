//! Characteristic value decoding.
//!
//! Turns a raw Environmental Sensing characteristic value into a physical
//! reading using its [`CharacteristicSpec`].

use crate::ble::characteristics::{ByteOrder, CharacteristicSpec, RawWidth};
use crate::error::{Error, Result};

/// Read the raw integer at the start of `data`.
///
/// Only the first `spec.width` bytes are used; trailing bytes are ignored.
pub fn raw_value(spec: &CharacteristicSpec, data: &[u8]) -> Result<i64> {
    let needed = spec.width.byte_len();
    if data.len() < needed {
        return Err(Error::PayloadTooShort {
            characteristic: spec.uuid,
            expected: needed,
            actual: data.len(),
        });
    }

    let value = match (spec.width, spec.byte_order) {
        (RawWidth::I16, ByteOrder::LittleEndian) => i16::from_le_bytes([data[0], data[1]]) as i64,
        (RawWidth::I16, ByteOrder::BigEndian) => i16::from_be_bytes([data[0], data[1]]) as i64,
        (RawWidth::U16, ByteOrder::LittleEndian) => u16::from_le_bytes([data[0], data[1]]) as i64,
        (RawWidth::U16, ByteOrder::BigEndian) => u16::from_be_bytes([data[0], data[1]]) as i64,
        (RawWidth::U32, ByteOrder::LittleEndian) => {
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64
        }
        (RawWidth::U32, ByteOrder::BigEndian) => {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as i64
        }
    };

    Ok(value)
}

/// Decode a characteristic value.
///
/// Returns `Ok(None)` when the raw integer equals the characteristic's sentinel (the
/// sensor has no current measurement), and `Ok(Some(raw / divisor))`
/// otherwise.
///
/// # Errors
///
/// Returns [`Error::PayloadTooShort`] if `data` is shorter than the characteristic's width.
///
/// # Example
///
/// ```
/// use env_sensors_ble::{decode, ReadingKind};
///
/// let spec = ReadingKind::Temperature.spec();
/// let value = decode(spec, &2345i16.to_le_bytes()).unwrap();
/// assert_eq!(value, Some(23.45));
/// ```
pub fn decode(spec: &CharacteristicSpec, data: &[u8]) -> Result<Option<f64>> {
    let raw = raw_value(spec, data)?;
    if raw == spec.sentinel {
        return Ok(None);
    }
    Ok(Some(raw as f64 / spec.divisor))
}
