//! Radio adapter abstraction.
//!
//! [`RadioAdapter`] is the seam between the session logic and a platform BLE
//! stack. Production code uses [`BtleplugRadio`](crate::ble::BtleplugRadio);
//! tests drive the monitor with an in-memory implementation.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::session::AdapterEvent;
use crate::error::Result;

/// Channel the adapter pushes unsolicited events into.
pub type EventSender<H> = mpsc::UnboundedSender<AdapterEvent<H>>;

/// A BLE central the session machine can command.
///
/// Command methods are awaited off the dispatcher, so a slow radio never
/// stalls event processing.
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    /// Opaque peripheral handle owned by the adapter.
    type Handle: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Begin delivering power changes, advertisements, disconnects and
    /// characteristic notifications into `events`.
    async fn start(&self, events: EventSender<Self::Handle>) -> Result<()>;

    /// Start scanning, optionally filtered to one service.
    async fn start_scan(&self, service_filter: Option<Uuid>) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Whether a scan is currently running.
    fn is_scanning(&self) -> bool;

    /// Connect to a peripheral.
    async fn connect(&self, handle: &Self::Handle) -> Result<()>;

    /// Disconnect from a peripheral.
    async fn disconnect(&self, handle: &Self::Handle) -> Result<()>;

    /// Discover all services and return their UUIDs.
    async fn discover_services(&self, handle: &Self::Handle) -> Result<Vec<Uuid>>;

    /// Return the characteristic UUIDs of a discovered service.
    async fn discover_characteristics(
        &self,
        handle: &Self::Handle,
        service: Uuid,
    ) -> Result<Vec<Uuid>>;

    /// Enable notifications for a characteristic.
    async fn enable_notify(&self, handle: &Self::Handle, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic's current value.
    async fn read_value(&self, handle: &Self::Handle, characteristic: Uuid) -> Result<Vec<u8>>;
}
