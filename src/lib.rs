// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # env-sensors-ble
//!
//! A Rust library for reading an environmental sensor peripheral over
//! Bluetooth Low Energy.
//!
//! The sensor advertises the local name `shitmeter` and exposes the standard
//! Environmental Sensing service with temperature, pressure and humidity
//! characteristics, plus a vendor CO2 characteristic. This crate finds it,
//! connects, subscribes to all four characteristics and publishes each
//! decoded value.
//!
//! ## Features
//!
//! - **Discovery**: Scan for the sensor by advertised name
//! - **Self-healing**: Periodic rescan after disconnects or failures
//! - **Decoding**: Table-driven decoding with "no reading" sentinels
//! - **Publishing**: Per-kind subscriptions and latest-value snapshots
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use env_sensors_ble::{ReadingKind, Result, SensorMonitor};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let monitor = SensorMonitor::new().await?;
//!
//!     let _temperature = monitor.on_reading(Some(ReadingKind::Temperature), |reading| {
//!         println!("Temperature: {:.1}°C", reading.value);
//!     });
//!
//!     monitor.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!
//!     println!("Last snapshot: {:?}", monitor.snapshot());
//!     monitor.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for reading types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod publisher;

// Re-exports for convenience
pub use config::MonitorConfig;
pub use error::{Error, Result};
pub use monitor::SensorMonitor;
pub use protocol::decode;
pub use publisher::{Reading, ReadingPublisher, ReadingSnapshot, SubscriptionHandle};

// Re-export commonly used types from submodules
pub use ble::{
    AdapterEvent, BtleplugRadio, ByteOrder, CharacteristicSpec, Command, RadioAdapter, RawWidth,
    ReadingKind, SessionMachine, SessionPhase,
};
