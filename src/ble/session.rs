//! Peripheral session state machine.
//!
//! [`SessionMachine`] owns the lifecycle of the one peripheral being pursued:
//! scan, connect, discover the Environmental Sensing service and its
//! characteristics, subscribe, and decode value updates. It never talks to the
//! radio directly. Each [`AdapterEvent`] goes through [`SessionMachine::handle`],
//! which returns the [`Command`]s the caller must issue. Outcomes of those
//! commands come back later as further events.

use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::spec_for_uuid;
use crate::ble::uuids::is_environmental_service;
use crate::config::MonitorConfig;
use crate::protocol::decode;
use crate::publisher::{Reading, ReadingPublisher};

/// Failure description reported by the radio adapter.
pub type AdapterFailure = String;

/// Phase of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    /// No candidate and not scanning.
    #[default]
    Idle,
    /// Scanning for the target advertisement.
    Scanning,
    /// Connect issued, waiting for the result.
    Connecting,
    /// Connected, waiting for the service list.
    DiscoveringServices,
    /// Waiting for the Environmental Sensing characteristics.
    DiscoveringCharacteristics,
    /// Notifications enabled; value updates are decoded.
    Subscribed,
}

impl SessionPhase {
    /// Check if a peripheral is connected (or being connected) in this phase.
    pub fn has_session(&self) -> bool {
        !matches!(self, Self::Idle | Self::Scanning)
    }

    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::DiscoveringCharacteristics | Self::Subscribed
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::DiscoveringCharacteristics => write!(f, "DiscoveringCharacteristics"),
            Self::Subscribed => write!(f, "Subscribed"),
        }
    }
}

/// Events delivered by the radio adapter, one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent<H> {
    /// The radio was powered on or off.
    PowerChanged {
        /// Whether the radio is now usable.
        powered_on: bool,
    },
    /// An advertisement was seen while scanning.
    Advertisement {
        /// Peripheral handle.
        handle: H,
        /// Advertised local name, if present.
        local_name: Option<String>,
        /// Advertised service UUIDs.
        services: Vec<Uuid>,
    },
    /// Outcome of a connect command.
    ConnectResult {
        /// Peripheral handle.
        handle: H,
        /// `Err` carries the adapter's failure description.
        result: Result<(), AdapterFailure>,
    },
    /// Outcome of a discover-services command.
    ServicesDiscovered {
        /// Peripheral handle.
        handle: H,
        /// Discovered service UUIDs.
        result: Result<Vec<Uuid>, AdapterFailure>,
    },
    /// Outcome of a discover-characteristics command.
    CharacteristicsDiscovered {
        /// Peripheral handle.
        handle: H,
        /// Service the characteristics belong to.
        service: Uuid,
        /// Discovered characteristic UUIDs.
        result: Result<Vec<Uuid>, AdapterFailure>,
    },
    /// Outcome of an enable-notify command.
    NotificationState {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Failure, if notifications could not be enabled.
        error: Option<AdapterFailure>,
    },
    /// A characteristic value arrived (notification or read response).
    ValueUpdated {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Raw value bytes.
        value: Bytes,
        /// Failure reported instead of a value.
        error: Option<AdapterFailure>,
    },
    /// The peripheral disconnected.
    Disconnected {
        /// Peripheral handle.
        handle: H,
    },
    /// Periodic rescan timer fired.
    RescanTick {
        /// Whether the adapter reports it is currently scanning.
        adapter_scanning: bool,
    },
}

/// Commands for the radio adapter. Fire-and-forget: results arrive as events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<H> {
    /// Start scanning, optionally filtered to one service.
    StartScan {
        /// Service UUID filter.
        service_filter: Option<Uuid>,
    },
    /// Stop scanning.
    StopScan,
    /// Connect to a peripheral.
    Connect(H),
    /// Drop the link to a peripheral.
    Disconnect(H),
    /// Discover all services.
    DiscoverServices(H),
    /// Discover all characteristics of a service.
    DiscoverCharacteristics {
        /// Peripheral handle.
        handle: H,
        /// Service UUID.
        service: Uuid,
    },
    /// Enable notifications for a characteristic.
    EnableNotify {
        /// Peripheral handle.
        handle: H,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// Read the current value of a characteristic.
    ReadValue {
        /// Peripheral handle.
        handle: H,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
}

/// The peripheral currently being connected or connected.
///
/// The handle is owned by the radio adapter; the session only refers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralSession<H> {
    handle: H,
    service: Option<Uuid>,
    subscribed: BTreeSet<Uuid>,
}

impl<H> PeripheralSession<H> {
    fn new(handle: H) -> Self {
        Self {
            handle,
            service: None,
            subscribed: BTreeSet::new(),
        }
    }

    /// The adapter's handle for the peripheral.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// The Environmental Sensing service, once discovered.
    pub fn service(&self) -> Option<Uuid> {
        self.service
    }

    /// Characteristics notifications were enabled for.
    pub fn subscribed(&self) -> &BTreeSet<Uuid> {
        &self.subscribed
    }
}

/// The session state machine.
pub struct SessionMachine<H> {
    config: MonitorConfig,
    publisher: ReadingPublisher,
    phase: SessionPhase,
    powered: bool,
    session: Option<PeripheralSession<H>>,
}

impl<H> SessionMachine<H>
where
    H: Clone + PartialEq + fmt::Debug,
{
    /// Create an idle machine publishing into `publisher`.
    pub fn new(config: MonitorConfig, publisher: ReadingPublisher) -> Self {
        Self {
            config,
            publisher,
            phase: SessionPhase::Idle,
            powered: false,
            session: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<&PeripheralSession<H>> {
        self.session.as_ref()
    }

    /// Whether the radio was last reported powered on.
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// The configuration in use.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Process one event and return the commands to issue, in order.
    pub fn handle(&mut self, event: AdapterEvent<H>) -> Vec<Command<H>> {
        let before = self.phase;

        let commands = match event {
            AdapterEvent::PowerChanged { powered_on } => self.on_power_changed(powered_on),
            AdapterEvent::Advertisement {
                handle,
                local_name,
                services,
            } => self.on_advertisement(handle, local_name, services),
            AdapterEvent::ConnectResult { handle, result } => self.on_connect_result(handle, result),
            AdapterEvent::ServicesDiscovered { handle, result } => {
                self.on_services_discovered(handle, result)
            }
            AdapterEvent::CharacteristicsDiscovered {
                handle,
                service,
                result,
            } => self.on_characteristics_discovered(handle, service, result),
            AdapterEvent::NotificationState {
                characteristic,
                error,
            } => {
                match error {
                    Some(e) => warn!("Failed to enable notifications for {}: {}", characteristic, e),
                    None => debug!("Notifications enabled for {}", characteristic),
                }
                Vec::new()
            }
            AdapterEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => {
                self.on_value_updated(characteristic, &value, error);
                Vec::new()
            }
            AdapterEvent::Disconnected { handle } => self.on_disconnected(handle),
            AdapterEvent::RescanTick { adapter_scanning } => self.on_rescan_tick(adapter_scanning),
        };

        if before != self.phase {
            debug!("Session phase changed: {} -> {}", before, self.phase);
        }

        commands
    }

    fn start_scan(&mut self) -> Vec<Command<H>> {
        self.session = None;
        self.phase = SessionPhase::Scanning;
        vec![Command::StartScan {
            service_filter: self.config.service_filter,
        }]
    }

    /// Drop the session and go back to idle.
    fn reset(&mut self) {
        self.session = None;
        self.phase = SessionPhase::Idle;
    }

    /// Treat a discovery error as transient: release the link and wait for
    /// the rescan timer.
    fn fail(&mut self, reason: &str) -> Vec<Command<H>> {
        warn!("Discovery failed in {}: {}", self.phase, reason);
        let handle = self.session.take().map(|s| s.handle);
        let was_connected = self.phase.is_connected();
        self.reset();
        match handle {
            Some(handle) if was_connected => vec![Command::Disconnect(handle)],
            _ => Vec::new(),
        }
    }

    /// Whether `handle` is the session's peripheral and the machine is in `phase`.
    fn expects(&self, phase: SessionPhase, handle: &H) -> bool {
        self.phase == phase && self.session.as_ref().is_some_and(|s| s.handle == *handle)
    }

    fn on_power_changed(&mut self, powered_on: bool) -> Vec<Command<H>> {
        self.powered = powered_on;

        if !powered_on {
            info!("Bluetooth radio powered off");
            self.reset();
            return Vec::new();
        }

        info!("Bluetooth radio powered on");
        if self.phase == SessionPhase::Idle {
            info!("Starting scan for \"{}\"", self.config.target_name);
            return self.start_scan();
        }
        Vec::new()
    }

    fn on_advertisement(
        &mut self,
        handle: H,
        local_name: Option<String>,
        services: Vec<Uuid>,
    ) -> Vec<Command<H>> {
        if !self.powered || self.phase.has_session() {
            trace!("Ignoring advertisement from {:?} in {}", handle, self.phase);
            return Vec::new();
        }

        if local_name.as_deref() != Some(self.config.target_name.as_str()) {
            trace!(
                "Ignoring advertisement from {:?} ({:?}, {} services)",
                handle,
                local_name,
                services.len()
            );
            return Vec::new();
        }

        info!("Found \"{}\" ({:?}), connecting", self.config.target_name, handle);
        self.session = Some(PeripheralSession::new(handle.clone()));
        self.phase = SessionPhase::Connecting;
        vec![Command::StopScan, Command::Connect(handle)]
    }

    fn on_connect_result(&mut self, handle: H, result: Result<(), AdapterFailure>) -> Vec<Command<H>> {
        if !self.expects(SessionPhase::Connecting, &handle) {
            debug!("Ignoring stale connect result for {:?} in {}", handle, self.phase);
            return Vec::new();
        }

        match result {
            Ok(()) => {
                info!("Connected to {:?}", handle);
                self.phase = SessionPhase::DiscoveringServices;
                vec![Command::DiscoverServices(handle)]
            }
            Err(e) => self.fail(&format!("connect failed: {}", e)),
        }
    }

    fn on_services_discovered(
        &mut self,
        handle: H,
        result: Result<Vec<Uuid>, AdapterFailure>,
    ) -> Vec<Command<H>> {
        if !self.expects(SessionPhase::DiscoveringServices, &handle) {
            debug!("Ignoring services for {:?} in {}", handle, self.phase);
            return Vec::new();
        }

        let services = match result {
            Ok(services) => services,
            Err(e) => return self.fail(&format!("service discovery failed: {}", e)),
        };

        let Some(service) = services.into_iter().find(is_environmental_service) else {
            return self.fail("Environmental Sensing service not present");
        };

        debug!("Found Environmental Sensing service {}", service);
        if let Some(session) = self.session.as_mut() {
            session.service = Some(service);
        }
        self.phase = SessionPhase::DiscoveringCharacteristics;
        vec![Command::DiscoverCharacteristics { handle, service }]
    }

    fn on_characteristics_discovered(
        &mut self,
        handle: H,
        service: Uuid,
        result: Result<Vec<Uuid>, AdapterFailure>,
    ) -> Vec<Command<H>> {
        if !self.expects(SessionPhase::DiscoveringCharacteristics, &handle)
            || self.session.as_ref().and_then(|s| s.service) != Some(service)
        {
            debug!(
                "Ignoring characteristics of {} for {:?} in {}",
                service, handle, self.phase
            );
            return Vec::new();
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => return self.fail(&format!("characteristic discovery failed: {}", e)),
        };

        let mut commands = Vec::new();
        if let Some(session) = self.session.as_mut() {
            for characteristic in characteristics {
                let Some(spec) = spec_for_uuid(&characteristic) else {
                    trace!("Skipping characteristic {}", characteristic);
                    continue;
                };
                if !session.subscribed.insert(characteristic) {
                    continue;
                }
                debug!("Subscribing to {} ({})", spec.kind, characteristic);
                commands.push(Command::EnableNotify {
                    handle: handle.clone(),
                    characteristic,
                });
                commands.push(Command::ReadValue {
                    handle: handle.clone(),
                    characteristic,
                });
            }

            if session.subscribed.is_empty() {
                warn!("No sensor characteristics on {:?}; no readings will arrive", handle);
            } else {
                info!("Subscribed to {} sensor characteristics", session.subscribed.len());
            }
        }

        self.phase = SessionPhase::Subscribed;
        commands
    }

    fn on_value_updated(&mut self, characteristic: Uuid, value: &[u8], error: Option<AdapterFailure>) {
        if let Some(e) = error {
            debug!("Dropping update for {}: {}", characteristic, e);
            return;
        }

        let subscribed = self.phase == SessionPhase::Subscribed
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.subscribed.contains(&characteristic));
        if !subscribed {
            debug!("Ignoring value for {} in {}", characteristic, self.phase);
            return;
        }

        let Some(spec) = spec_for_uuid(&characteristic) else {
            return;
        };

        trace!("Value for {}: {:02X?}", spec.kind, value);

        match decode(&spec.with_byte_order(self.config.byte_order), value) {
            Ok(Some(decoded)) => self.publisher.publish(Reading::new(spec.kind, decoded)),
            Ok(None) => debug!("{} sensor has no reading", spec.kind),
            Err(e) => debug!("Dropping malformed {} value: {}", spec.kind, e),
        }
    }

    fn on_disconnected(&mut self, handle: H) -> Vec<Command<H>> {
        if !self.session.as_ref().is_some_and(|s| s.handle == handle) {
            debug!("Ignoring disconnect of {:?} in {}", handle, self.phase);
            return Vec::new();
        }

        info!("Disconnected from {:?}", handle);
        self.reset();
        Vec::new()
    }

    fn on_rescan_tick(&mut self, adapter_scanning: bool) -> Vec<Command<H>> {
        if !self.powered || self.phase.has_session() || adapter_scanning {
            trace!(
                "Rescan not needed (phase {}, adapter scanning: {})",
                self.phase,
                adapter_scanning
            );
            return Vec::new();
        }

        info!("Adapter is not scanning in {}, rescanning", self.phase);
        self.start_scan()
    }
}

impl<H: fmt::Debug> fmt::Debug for SessionMachine<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMachine")
            .field("phase", &self.phase)
            .field("powered", &self.powered)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::characteristics::{ByteOrder, ReadingKind};
    use crate::ble::uuids::*;
    use crate::publisher::ReadingSnapshot;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    type Machine = SessionMachine<u32>;

    const DEVICE: u32 = 7;

    fn machine() -> (Machine, ReadingPublisher) {
        let publisher = ReadingPublisher::new();
        let machine = SessionMachine::new(MonitorConfig::default(), publisher.clone());
        (machine, publisher)
    }

    fn advertisement(handle: u32, name: &str) -> AdapterEvent<u32> {
        AdapterEvent::Advertisement {
            handle,
            local_name: Some(name.to_string()),
            services: vec![ENVIRONMENTAL_SENSING_SERVICE_UUID],
        }
    }

    fn value(characteristic: Uuid, bytes: &[u8]) -> AdapterEvent<u32> {
        AdapterEvent::ValueUpdated {
            characteristic,
            value: Bytes::copy_from_slice(bytes),
            error: None,
        }
    }

    fn scanning() -> (Machine, ReadingPublisher) {
        let (mut m, publisher) = machine();
        m.handle(AdapterEvent::PowerChanged { powered_on: true });
        (m, publisher)
    }

    /// Drive a machine all the way to `Subscribed` with the given characteristics.
    fn subscribed(characteristics: Vec<Uuid>) -> (Machine, ReadingPublisher) {
        let (mut m, publisher) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });
        m.handle(AdapterEvent::CharacteristicsDiscovered {
            handle: DEVICE,
            service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            result: Ok(characteristics),
        });
        assert_eq!(m.phase(), SessionPhase::Subscribed);
        (m, publisher)
    }

    #[test]
    fn test_power_on_starts_filtered_scan() {
        let (mut m, _) = machine();
        assert_eq!(m.phase(), SessionPhase::Idle);

        let commands = m.handle(AdapterEvent::PowerChanged { powered_on: true });
        assert_eq!(
            commands,
            vec![Command::StartScan {
                service_filter: Some(ENVIRONMENTAL_SENSING_SERVICE_UUID)
            }]
        );
        assert_eq!(m.phase(), SessionPhase::Scanning);
    }

    #[test]
    fn test_unfiltered_scan() {
        let publisher = ReadingPublisher::new();
        let mut m: Machine =
            SessionMachine::new(MonitorConfig::default().with_service_filter(None), publisher);
        let commands = m.handle(AdapterEvent::PowerChanged { powered_on: true });
        assert_eq!(commands, vec![Command::StartScan { service_filter: None }]);
    }

    #[test]
    fn test_non_matching_advertisements_never_connect() {
        let (mut m, _) = scanning();
        for (i, name) in ["Shitmeter", "shitmeter2", "", "thermo", " shitmeter"]
            .iter()
            .enumerate()
        {
            assert!(m.handle(advertisement(i as u32, name)).is_empty());
        }
        let commands = m.handle(AdapterEvent::Advertisement {
            handle: 99,
            local_name: None,
            services: vec![],
        });
        assert!(commands.is_empty());
        assert_eq!(m.phase(), SessionPhase::Scanning);
        assert!(m.session().is_none());
    }

    proptest! {
        #[test]
        fn prop_non_matching_names_never_connect(
            names in proptest::collection::vec(
                proptest::option::of(
                    "\\PC{0,24}".prop_filter("target name", |n| n != TARGET_LOCAL_NAME)
                ),
                1..64,
            )
        ) {
            let (mut m, _) = scanning();
            for (i, local_name) in names.into_iter().enumerate() {
                let commands = m.handle(AdapterEvent::Advertisement {
                    handle: i as u32,
                    local_name,
                    services: vec![ENVIRONMENTAL_SENSING_SERVICE_UUID],
                });
                prop_assert!(commands.is_empty());
            }
            prop_assert_eq!(m.phase(), SessionPhase::Scanning);
            prop_assert!(m.session().is_none());
        }
    }

    #[test]
    fn test_matching_advertisement_connects() {
        let (mut m, _) = scanning();
        let commands = m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        assert_eq!(commands, vec![Command::StopScan, Command::Connect(DEVICE)]);
        assert_eq!(m.phase(), SessionPhase::Connecting);
        assert_eq!(m.session().map(|s| *s.handle()), Some(DEVICE));
    }

    #[test]
    fn test_second_advertisement_while_connecting_ignored() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        assert!(m.handle(advertisement(8, TARGET_LOCAL_NAME)).is_empty());
        assert_eq!(m.session().map(|s| *s.handle()), Some(DEVICE));
    }

    #[test]
    fn test_advertisement_ignored_while_powered_off() {
        let (mut m, _) = machine();
        assert!(m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME)).is_empty());
        assert_eq!(m.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_stale_connect_result_ignored() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));

        let commands = m.handle(AdapterEvent::ConnectResult {
            handle: 3,
            result: Ok(()),
        });
        assert!(commands.is_empty());
        assert_eq!(m.phase(), SessionPhase::Connecting);

        let commands = m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        assert_eq!(commands, vec![Command::DiscoverServices(DEVICE)]);
        assert_eq!(m.phase(), SessionPhase::DiscoveringServices);

        // A duplicate success for the right handle is also stale now.
        assert!(m
            .handle(AdapterEvent::ConnectResult {
                handle: DEVICE,
                result: Ok(()),
            })
            .is_empty());
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        let commands = m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Err("timeout".to_string()),
        });
        assert!(commands.is_empty());
        assert_eq!(m.phase(), SessionPhase::Idle);
        assert!(m.session().is_none());
    }

    #[test]
    fn test_first_environmental_service_wins() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });

        let commands = m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![
                uuid_from_u16(0x180a),
                ENVIRONMENTAL_SENSING_SERVICE_UUID,
                ENVIRONMENTAL_SENSING_SERVICE_UUID,
            ]),
        });
        assert_eq!(
            commands,
            vec![Command::DiscoverCharacteristics {
                handle: DEVICE,
                service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            }]
        );
        assert_eq!(m.phase(), SessionPhase::DiscoveringCharacteristics);
        assert_eq!(
            m.session().and_then(|s| s.service()),
            Some(ENVIRONMENTAL_SENSING_SERVICE_UUID)
        );
    }

    #[test]
    fn test_missing_service_is_discovery_failure() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });

        let commands = m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![uuid_from_u16(0x180a)]),
        });
        assert_eq!(commands, vec![Command::Disconnect(DEVICE)]);
        assert_eq!(m.phase(), SessionPhase::Idle);
        assert!(m.session().is_none());
    }

    #[test]
    fn test_service_discovery_error_returns_to_idle() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        let commands = m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Err("gatt error".to_string()),
        });
        assert_eq!(commands, vec![Command::Disconnect(DEVICE)]);
        assert_eq!(m.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_characteristics_subscribe_and_read() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });

        let commands = m.handle(AdapterEvent::CharacteristicsDiscovered {
            handle: DEVICE,
            service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            result: Ok(vec![TEMPERATURE_UUID, uuid_from_u16(0x2a19), HUMIDITY_UUID]),
        });
        assert_eq!(
            commands,
            vec![
                Command::EnableNotify {
                    handle: DEVICE,
                    characteristic: TEMPERATURE_UUID
                },
                Command::ReadValue {
                    handle: DEVICE,
                    characteristic: TEMPERATURE_UUID
                },
                Command::EnableNotify {
                    handle: DEVICE,
                    characteristic: HUMIDITY_UUID
                },
                Command::ReadValue {
                    handle: DEVICE,
                    characteristic: HUMIDITY_UUID
                },
            ]
        );
        assert_eq!(m.phase(), SessionPhase::Subscribed);
        assert_eq!(m.session().map(|s| s.subscribed().len()), Some(2));
    }

    #[test]
    fn test_zero_matching_characteristics_still_subscribed() {
        let (mut m, publisher) = subscribed(vec![uuid_from_u16(0x2a19)]);
        assert!(m.session().is_some_and(|s| s.subscribed().is_empty()));

        m.handle(value(TEMPERATURE_UUID, &2500i16.to_le_bytes()));
        assert_eq!(publisher.latest(ReadingKind::Temperature), None);
    }

    #[test]
    fn test_characteristic_discovery_error_returns_to_idle() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });
        let commands = m.handle(AdapterEvent::CharacteristicsDiscovered {
            handle: DEVICE,
            service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            result: Err("insufficient resources".to_string()),
        });
        assert_eq!(commands, vec![Command::Disconnect(DEVICE)]);
        assert_eq!(m.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_value_update_publishes_decoded_reading() {
        let (mut m, publisher) = subscribed(vec![TEMPERATURE_UUID, PRESSURE_UUID]);

        assert!(m
            .handle(value(TEMPERATURE_UUID, &2345i16.to_le_bytes()))
            .is_empty());
        m.handle(value(PRESSURE_UUID, &10132u32.to_le_bytes()));

        assert_eq!(publisher.latest(ReadingKind::Temperature), Some(23.45));
        assert_eq!(publisher.latest(ReadingKind::Pressure), Some(1013.2));
    }

    #[test]
    fn test_sentinel_suppresses_publication() {
        let all = CHARACTERISTIC_UUIDS.to_vec();
        let (mut m, publisher) = subscribed(all);

        m.handle(value(TEMPERATURE_UUID, &i16::MAX.to_le_bytes()));
        m.handle(value(PRESSURE_UUID, &u32::MAX.to_le_bytes()));
        m.handle(value(HUMIDITY_UUID, &u16::MAX.to_le_bytes()));
        m.handle(value(CO2_UUID, &[0xFF, 0xFF]));

        assert_eq!(publisher.snapshot(), ReadingSnapshot::default());
    }

    #[test]
    fn test_sentinel_does_not_clear_previous_value() {
        let (mut m, publisher) = subscribed(vec![CO2_UUID]);
        m.handle(value(CO2_UUID, &612u16.to_le_bytes()));
        m.handle(value(CO2_UUID, &[0xFF, 0xFF]));
        assert_eq!(publisher.latest(ReadingKind::Co2), Some(612.0));
    }

    #[test]
    fn test_short_payload_dropped() {
        let (mut m, publisher) = subscribed(vec![PRESSURE_UUID, HUMIDITY_UUID]);
        m.handle(value(PRESSURE_UUID, &[0x01, 0x02]));
        m.handle(value(HUMIDITY_UUID, &[]));
        assert_eq!(publisher.snapshot(), ReadingSnapshot::default());
        assert_eq!(m.phase(), SessionPhase::Subscribed);
    }

    #[test]
    fn test_value_with_error_dropped() {
        let (mut m, publisher) = subscribed(vec![HUMIDITY_UUID]);
        m.handle(AdapterEvent::ValueUpdated {
            characteristic: HUMIDITY_UUID,
            value: Bytes::from_static(&[0x10, 0x27]),
            error: Some("read not permitted".to_string()),
        });
        assert_eq!(publisher.latest(ReadingKind::Humidity), None);
    }

    #[test]
    fn test_unknown_and_unsubscribed_characteristics_ignored() {
        let (mut m, publisher) = subscribed(vec![TEMPERATURE_UUID]);
        m.handle(value(uuid_from_u16(0x2a19), &[0x64]));
        m.handle(value(HUMIDITY_UUID, &4000u16.to_le_bytes()));
        assert_eq!(publisher.snapshot(), ReadingSnapshot::default());
    }

    #[test]
    fn test_big_endian_config() {
        let publisher = ReadingPublisher::new();
        let config = MonitorConfig::default().with_byte_order(ByteOrder::BigEndian);
        let mut m: Machine = SessionMachine::new(config, publisher.clone());
        m.handle(AdapterEvent::PowerChanged { powered_on: true });
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });
        m.handle(AdapterEvent::CharacteristicsDiscovered {
            handle: DEVICE,
            service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            result: Ok(vec![CO2_UUID]),
        });
        m.handle(value(CO2_UUID, &[0x01, 0x90]));
        assert_eq!(publisher.latest(ReadingKind::Co2), Some(400.0));
    }

    #[test]
    fn test_disconnect_returns_to_idle_and_reconnects() {
        let (mut m, publisher) = subscribed(vec![TEMPERATURE_UUID]);

        assert!(m.handle(AdapterEvent::Disconnected { handle: DEVICE }).is_empty());
        assert_eq!(m.phase(), SessionPhase::Idle);
        assert!(m.session().is_none());

        // Values after the link is gone are not published.
        m.handle(value(TEMPERATURE_UUID, &2000i16.to_le_bytes()));
        assert_eq!(publisher.latest(ReadingKind::Temperature), None);

        let commands = m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        assert_eq!(commands, vec![Command::StopScan, Command::Connect(DEVICE)]);
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });
        m.handle(AdapterEvent::CharacteristicsDiscovered {
            handle: DEVICE,
            service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            result: Ok(vec![TEMPERATURE_UUID]),
        });
        m.handle(value(TEMPERATURE_UUID, &2000i16.to_le_bytes()));
        assert_eq!(publisher.latest(ReadingKind::Temperature), Some(20.0));
    }

    #[test]
    fn test_disconnect_of_other_peripheral_ignored() {
        let (mut m, _) = subscribed(vec![TEMPERATURE_UUID]);
        m.handle(AdapterEvent::Disconnected { handle: 42 });
        assert_eq!(m.phase(), SessionPhase::Subscribed);
    }

    #[test]
    fn test_disconnect_while_discovering() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        m.handle(AdapterEvent::Disconnected { handle: DEVICE });
        assert_eq!(m.phase(), SessionPhase::Idle);

        // Late discovery results for the dropped session are ignored.
        let commands = m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });
        assert!(commands.is_empty());
        assert_eq!(m.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_rescan_tick_in_each_phase() {
        let scan = vec![Command::StartScan {
            service_filter: Some(ENVIRONMENTAL_SENSING_SERVICE_UUID),
        }];

        // Idle (after a failure), adapter idle: rescan.
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Err("refused".to_string()),
        });
        assert_eq!(m.phase(), SessionPhase::Idle);
        assert_eq!(
            m.handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            }),
            scan
        );
        assert_eq!(m.phase(), SessionPhase::Scanning);

        // Scanning, adapter scanning: nothing.
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: true
            })
            .is_empty());

        // Scanning, adapter stopped behind our back: rescan.
        assert_eq!(
            m.handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            }),
            scan
        );

        // Connecting: never rescans.
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));
        assert_eq!(m.phase(), SessionPhase::Connecting);
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            })
            .is_empty());

        // Discovering: never rescans.
        m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            })
            .is_empty());
        m.handle(AdapterEvent::ServicesDiscovered {
            handle: DEVICE,
            result: Ok(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]),
        });
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            })
            .is_empty());

        // Subscribed: never rescans.
        m.handle(AdapterEvent::CharacteristicsDiscovered {
            handle: DEVICE,
            service: ENVIRONMENTAL_SENSING_SERVICE_UUID,
            result: Ok(vec![TEMPERATURE_UUID]),
        });
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            })
            .is_empty());
        assert_eq!(m.phase(), SessionPhase::Subscribed);
    }

    #[test]
    fn test_rescan_tick_powered_off() {
        let (mut m, _) = machine();
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            })
            .is_empty());
        assert_eq!(m.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_tick_racing_connect_keeps_candidate() {
        let (mut m, _) = scanning();
        m.handle(advertisement(DEVICE, TARGET_LOCAL_NAME));

        // StopScan was just issued, so the adapter reports not scanning while
        // the connect is still in flight.
        assert!(m
            .handle(AdapterEvent::RescanTick {
                adapter_scanning: false
            })
            .is_empty());
        assert_eq!(m.session().map(|s| *s.handle()), Some(DEVICE));

        let commands = m.handle(AdapterEvent::ConnectResult {
            handle: DEVICE,
            result: Ok(()),
        });
        assert_eq!(commands, vec![Command::DiscoverServices(DEVICE)]);
    }

    #[test]
    fn test_power_off_drops_session() {
        let (mut m, _) = subscribed(vec![TEMPERATURE_UUID]);
        assert!(m
            .handle(AdapterEvent::PowerChanged { powered_on: false })
            .is_empty());
        assert_eq!(m.phase(), SessionPhase::Idle);
        assert!(m.session().is_none());
        assert!(!m.is_powered());

        let commands = m.handle(AdapterEvent::PowerChanged { powered_on: true });
        assert_eq!(commands.len(), 1);
        assert_eq!(m.phase(), SessionPhase::Scanning);
    }

    #[test]
    fn test_session_phase_helpers() {
        assert!(!SessionPhase::Idle.has_session());
        assert!(!SessionPhase::Scanning.has_session());
        assert!(SessionPhase::Connecting.has_session());
        assert!(!SessionPhase::Connecting.is_connected());
        assert!(SessionPhase::Subscribed.is_connected());
        assert_eq!(
            SessionPhase::DiscoveringServices.to_string(),
            "DiscoveringServices"
        );
    }
}
