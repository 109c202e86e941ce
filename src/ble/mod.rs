//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy side of the crate: the
//! characteristic table, the session state machine, and the radio adapters
//! it drives.

pub mod btleplug_radio;
pub mod characteristics;
pub mod radio;
pub mod session;
pub mod uuids;

pub use btleplug_radio::BtleplugRadio;
pub use characteristics::{ByteOrder, CharacteristicSpec, RawWidth, ReadingKind};
pub use radio::{EventSender, RadioAdapter};
pub use session::{AdapterEvent, Command, PeripheralSession, SessionMachine, SessionPhase};
pub use uuids::*;
