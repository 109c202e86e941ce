//! btleplug-backed radio adapter.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::ble::radio::{EventSender, RadioAdapter};
use crate::ble::session::AdapterEvent;
use crate::error::{Error, Result};

/// Radio adapter on top of the platform Bluetooth stack.
pub struct BtleplugRadio {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<AtomicBool>,
    /// Where events go once started.
    event_tx: Arc<RwLock<Option<EventSender<PeripheralId>>>>,
    /// Central event pump.
    central_handle: Mutex<Option<JoinHandle<()>>>,
    /// Notification pumps by peripheral.
    notification_handles: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            is_scanning: Arc::new(AtomicBool::new(false)),
            event_tx: Arc::new(RwLock::new(None)),
            central_handle: Mutex::new(None),
            notification_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.adapter
            .peripheral(id)
            .await
            .map_err(|_| Error::UnknownPeripheral {
                identifier: id.to_string(),
            })
    }

    async fn characteristic(&self, id: &PeripheralId, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::CharacteristicNotFound { uuid })?;
        Ok((peripheral, characteristic))
    }

    /// Translate one central event into an adapter event.
    async fn handle_central_event(
        adapter: &Adapter,
        event: CentralEvent,
        tx: &EventSender<PeripheralId>,
    ) {
        match event {
            CentralEvent::StateUpdate(state) => {
                debug!("Adapter state changed: {:?}", state);
                let _ = tx.send(AdapterEvent::PowerChanged {
                    powered_on: matches!(state, CentralState::PoweredOn),
                });
            }
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Failed to get peripheral: {}", e);
                        return;
                    }
                };

                let properties = match peripheral.properties().await {
                    Ok(Some(p)) => p,
                    _ => return,
                };

                let _ = tx.send(AdapterEvent::Advertisement {
                    handle: id,
                    local_name: properties.local_name,
                    services: properties.services,
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let _ = tx.send(AdapterEvent::Disconnected { handle: id });
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RadioAdapter for BtleplugRadio {
    type Handle = PeripheralId;

    async fn start(&self, events: EventSender<PeripheralId>) -> Result<()> {
        let mut central_events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        *self.event_tx.write() = Some(events.clone());

        // Platforms that never send a state update are assumed powered.
        let powered_on = match self.adapter.adapter_state().await {
            Ok(state) => matches!(state, CentralState::PoweredOn),
            Err(e) => {
                debug!("Adapter state unavailable ({}), assuming powered on", e);
                true
            }
        };
        let _ = events.send(AdapterEvent::PowerChanged { powered_on });

        let adapter = self.adapter.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                Self::handle_central_event(&adapter, event, &events).await;
                if events.is_closed() {
                    break;
                }
            }
            debug!("Central event loop ended");
        });

        if let Some(old) = self.central_handle.lock().replace(handle) {
            old.abort();
        }

        Ok(())
    }

    async fn start_scan(&self, service_filter: Option<Uuid>) -> Result<()> {
        info!("Starting BLE scan (filter: {:?})", service_filter);

        let filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };
        // Set first so a stop issued while the request is pending is not a no-op.
        self.is_scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.adapter.start_scan(filter).await {
            self.is_scanning.store(false, Ordering::SeqCst);
            return Err(Error::Bluetooth(e));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if !self.is_scanning.swap(false, Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    async fn connect(&self, handle: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;
        peripheral.connect().await.map_err(Error::Bluetooth)?;

        let mut notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;
        let tx = self.event_tx.read().clone();
        let id = handle.clone();

        let pump = tokio::spawn(async move {
            debug!("Notification listener for {:?} starting", id);
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {:02X?}",
                    notification.uuid,
                    notification.value
                );
                let Some(tx) = tx.as_ref() else { break };
                let sent = tx.send(AdapterEvent::ValueUpdated {
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                    error: None,
                });
                if sent.is_err() {
                    break;
                }
            }
            debug!("Notification listener for {:?} stopped", id);
        });

        if let Some(old) = self.notification_handles.lock().insert(handle.clone(), pump) {
            old.abort();
        }

        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralId) -> Result<()> {
        if let Some(pump) = self.notification_handles.lock().remove(handle) {
            pump.abort();
        }

        let peripheral = self.peripheral(handle).await?;
        match peripheral.disconnect().await {
            Ok(()) => {
                info!("Disconnected from {:?}", handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(Error::Bluetooth(e))
            }
        }
    }

    async fn discover_services(&self, handle: &PeripheralId) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(handle).await?;
        peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let services: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        debug!("Discovered {} services on {:?}", services.len(), handle);
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        handle: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(handle).await?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(Error::ServiceNotFound { uuid: service })?;

        for characteristic in &service.characteristics {
            debug!(
                "Found characteristic: {} in service {}",
                characteristic.uuid, service.uuid
            );
        }

        Ok(service.characteristics.iter().map(|c| c.uuid).collect())
    }

    async fn enable_notify(&self, handle: &PeripheralId, characteristic: Uuid) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(handle, characteristic).await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;
        debug!("Subscribed to notifications from {}", characteristic.uuid);
        Ok(())
    }

    async fn read_value(&self, handle: &PeripheralId, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(handle, characteristic).await?;
        let data = peripheral
            .read(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;
        trace!("Read {} bytes from characteristic {}", data.len(), characteristic.uuid);
        Ok(data)
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        if let Some(handle) = self.central_handle.lock().take() {
            handle.abort();
        }
        for (_, pump) in self.notification_handles.lock().drain() {
            pump.abort();
        }
    }
}
