//! Sensor monitor: drives the session state machine from a radio adapter.
//!
//! All adapter events, command outcomes and rescan ticks are funneled into a
//! single channel and processed one at a time by a dispatcher task that owns
//! the [`SessionMachine`]. The dispatcher hands each command batch to one
//! executor task. Scan commands are issued there in batch order; the rest of a
//! batch runs on a tracked task and reports back through the event channel.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::ble::btleplug_radio::BtleplugRadio;
use crate::ble::characteristics::ReadingKind;
use crate::ble::radio::{EventSender, RadioAdapter};
use crate::ble::session::{AdapterEvent, Command, SessionMachine, SessionPhase};
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::publisher::{Reading, ReadingPublisher, ReadingSnapshot, SubscriptionHandle};

type EventReceiver<H> = mpsc::UnboundedReceiver<AdapterEvent<H>>;
type CommandSender<H> = mpsc::UnboundedSender<Vec<Command<H>>>;
type CommandReceiver<H> = mpsc::UnboundedReceiver<Vec<Command<H>>>;

/// Discovers the sensor, keeps it connected and publishes its readings.
pub struct SensorMonitor<R: RadioAdapter> {
    /// The radio being driven.
    radio: Arc<R>,
    /// Configuration handed to the state machine.
    config: MonitorConfig,
    /// Where readings go.
    publisher: ReadingPublisher,
    /// Phase after the last processed event.
    phase: Arc<RwLock<SessionPhase>>,
    /// Handle of the current session's peripheral.
    session_handle: Arc<RwLock<Option<R::Handle>>>,
    /// Event channel shared by the radio, command tasks and the ticker.
    event_tx: EventSender<R::Handle>,
    /// Receiving end, taken by the dispatcher on start.
    event_rx: Mutex<Option<EventReceiver<R::Handle>>>,
    /// Dispatcher task.
    dispatcher_handle: RwLock<Option<JoinHandle<()>>>,
    /// Command executor task; owns every in-flight command.
    executor_handle: RwLock<Option<JoinHandle<()>>>,
    /// Rescan timer task.
    ticker_handle: RwLock<Option<JoinHandle<()>>>,
    /// Running flag.
    is_running: Arc<AtomicBool>,
}

impl SensorMonitor<BtleplugRadio> {
    /// Create a monitor on the system's first Bluetooth adapter with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(MonitorConfig::default()).await
    }

    /// Create a monitor on the system's first Bluetooth adapter.
    pub async fn with_config(config: MonitorConfig) -> Result<Self> {
        let radio = BtleplugRadio::new().await?;
        Ok(Self::with_radio(radio, config))
    }
}

impl<R: RadioAdapter> SensorMonitor<R> {
    /// Create a monitor driving `radio`.
    pub fn with_radio(radio: R, config: MonitorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            radio: Arc::new(radio),
            config,
            publisher: ReadingPublisher::new(),
            phase: Arc::new(RwLock::new(SessionPhase::Idle)),
            session_handle: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            dispatcher_handle: RwLock::new(None),
            executor_handle: RwLock::new(None),
            ticker_handle: RwLock::new(None),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the dispatcher, the rescan timer and the radio's event stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] on a second call, or the radio's
    /// error if it cannot start delivering events.
    pub async fn start(&self) -> Result<()> {
        let event_rx = self.event_rx.lock().take().ok_or(Error::AlreadyRunning)?;

        info!("Starting sensor monitor for \"{}\"", self.config.target_name);
        self.is_running.store(true, Ordering::SeqCst);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let executor = tokio::spawn(Self::run_commands(
            self.radio.clone(),
            command_rx,
            self.event_tx.clone(),
        ));
        *self.executor_handle.write() = Some(executor);

        let machine = SessionMachine::new(self.config.clone(), self.publisher.clone());
        let dispatcher = tokio::spawn(Self::dispatch(
            machine,
            event_rx,
            command_tx,
            self.phase.clone(),
            self.session_handle.clone(),
        ));
        *self.dispatcher_handle.write() = Some(dispatcher);

        let interval = self.config.rescan_interval;
        let radio = self.radio.clone();
        let tx = self.event_tx.clone();
        let is_running = self.is_running.clone();
        let ticker = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately.
            timer.tick().await;
            while is_running.load(Ordering::SeqCst) {
                timer.tick().await;
                let tick = AdapterEvent::RescanTick {
                    adapter_scanning: radio.is_scanning(),
                };
                if tx.send(tick).is_err() {
                    break;
                }
            }
            debug!("Rescan timer ended");
        });
        *self.ticker_handle.write() = Some(ticker);

        self.radio.start(self.event_tx.clone()).await
    }

    /// Stop processing, stop scanning and drop any connection.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down sensor monitor");

        if let Some(handle) = self.ticker_handle.write().take() {
            handle.abort();
        }
        if let Some(handle) = self.dispatcher_handle.write().take() {
            handle.abort();
        }
        // Dropping the executor's JoinSet cancels commands still in flight.
        let executor = self.executor_handle.write().take();
        if let Some(handle) = executor {
            handle.abort();
            let _ = handle.await;
        }

        if self.radio.is_scanning() {
            self.radio.stop_scan().await?;
        }

        let session = self.session_handle.write().take();
        if let Some(handle) = session {
            if let Err(e) = self.radio.disconnect(&handle).await {
                warn!("Error disconnecting {:?}: {}", handle, e);
            }
        }

        *self.phase.write() = SessionPhase::Idle;
        Ok(())
    }

    /// The publisher readings are delivered through.
    pub fn publisher(&self) -> &ReadingPublisher {
        &self.publisher
    }

    /// Register a callback for readings, optionally filtered to one kind.
    pub fn on_reading<F>(&self, kind: Option<ReadingKind>, callback: F) -> SubscriptionHandle
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        self.publisher.subscribe(kind, callback)
    }

    /// Latest value for a kind.
    pub fn latest(&self, kind: ReadingKind) -> Option<f64> {
        self.publisher.latest(kind)
    }

    /// Latest values for all kinds.
    pub fn snapshot(&self) -> ReadingSnapshot {
        self.publisher.snapshot()
    }

    /// Session phase after the most recent event.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    /// Check if the monitor is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// The radio being driven.
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Dispatcher loop: the only owner of the state machine.
    async fn dispatch(
        mut machine: SessionMachine<R::Handle>,
        mut event_rx: EventReceiver<R::Handle>,
        command_tx: CommandSender<R::Handle>,
        phase: Arc<RwLock<SessionPhase>>,
        session_handle: Arc<RwLock<Option<R::Handle>>>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let commands = machine.handle(event);

            *phase.write() = machine.phase();
            *session_handle.write() = machine.session().map(|s| s.handle().clone());

            if !commands.is_empty() && command_tx.send(commands).is_err() {
                break;
            }
        }
        debug!("Dispatcher ended");
    }

    /// Executor loop: takes batches in the order the dispatcher emitted them.
    ///
    /// Leading scan commands are awaited here, so a start and a later stop
    /// always reach the radio in that order. The remainder of the batch
    /// (connect, discovery, reads) runs in order on a task in `in_flight`.
    async fn run_commands(
        radio: Arc<R>,
        mut command_rx: CommandReceiver<R::Handle>,
        tx: EventSender<R::Handle>,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                batch = command_rx.recv() => {
                    let Some(mut batch) = batch else { break };

                    let split = batch
                        .iter()
                        .position(|c| !matches!(c, Command::StartScan { .. } | Command::StopScan))
                        .unwrap_or(batch.len());
                    let rest = batch.split_off(split);

                    for command in batch {
                        Self::issue(&radio, command, &tx).await;
                    }

                    if !rest.is_empty() {
                        let radio = radio.clone();
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            for command in rest {
                                if !Self::issue(&radio, command, &tx).await {
                                    break;
                                }
                            }
                        });
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
        debug!("Command executor ended");
    }

    /// Issue one command and report its outcome. Returns `false` once the
    /// event channel is closed.
    async fn issue(radio: &R, command: Command<R::Handle>, tx: &EventSender<R::Handle>) -> bool {
        debug!("Issuing {:?}", command);

        let event = match command {
            Command::StartScan { service_filter } => {
                if let Err(e) = radio.start_scan(service_filter).await {
                    warn!("Failed to start scan: {}", e);
                }
                None
            }
            Command::StopScan => {
                if let Err(e) = radio.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
                None
            }
            Command::Connect(handle) => {
                let result = radio.connect(&handle).await.map_err(|e| e.to_string());
                Some(AdapterEvent::ConnectResult { handle, result })
            }
            Command::Disconnect(handle) => {
                if let Err(e) = radio.disconnect(&handle).await {
                    warn!("Failed to disconnect {:?}: {}", handle, e);
                }
                None
            }
            Command::DiscoverServices(handle) => {
                let result = radio
                    .discover_services(&handle)
                    .await
                    .map_err(|e| e.to_string());
                Some(AdapterEvent::ServicesDiscovered { handle, result })
            }
            Command::DiscoverCharacteristics { handle, service } => {
                let result = radio
                    .discover_characteristics(&handle, service)
                    .await
                    .map_err(|e| e.to_string());
                Some(AdapterEvent::CharacteristicsDiscovered {
                    handle,
                    service,
                    result,
                })
            }
            Command::EnableNotify {
                handle,
                characteristic,
            } => {
                let error = radio
                    .enable_notify(&handle, characteristic)
                    .await
                    .err()
                    .map(|e| e.to_string());
                Some(AdapterEvent::NotificationState {
                    characteristic,
                    error,
                })
            }
            Command::ReadValue {
                handle,
                characteristic,
            } => {
                let event = match radio.read_value(&handle, characteristic).await {
                    Ok(data) => AdapterEvent::ValueUpdated {
                        characteristic,
                        value: Bytes::from(data),
                        error: None,
                    },
                    Err(e) => AdapterEvent::ValueUpdated {
                        characteristic,
                        value: Bytes::new(),
                        error: Some(e.to_string()),
                    },
                };
                Some(event)
            }
        };

        match event {
            Some(event) => tx.send(event).is_ok(),
            None => true,
        }
    }
}

impl<R: RadioAdapter> Drop for SensorMonitor<R> {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker_handle.write().take() {
            handle.abort();
        }
        if let Some(handle) = self.dispatcher_handle.write().take() {
            handle.abort();
        }
        if let Some(handle) = self.executor_handle.write().take() {
            handle.abort();
        }
    }
}
