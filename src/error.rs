//! Error types for the env-sensors-ble crate.

use thiserror::Error;
use uuid::Uuid;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A characteristic value was shorter than its declared integer width.
    #[error("Payload too short for {characteristic}: expected {expected} bytes, got {actual}")]
    PayloadTooShort {
        /// The characteristic the payload was delivered for.
        characteristic: Uuid,
        /// Number of bytes the characteristic's width requires.
        expected: usize,
        /// Number of bytes actually received.
        actual: usize,
    },

    /// The adapter has no peripheral with the given handle.
    #[error("Unknown peripheral: {identifier}")]
    UnknownPeripheral {
        /// The handle that was looked up.
        identifier: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: Uuid,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: Uuid,
    },

    /// The monitor was started twice.
    #[error("Monitor already running")]
    AlreadyRunning,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
