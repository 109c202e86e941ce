//! Reading distribution.
//!
//! [`ReadingPublisher`] is the single broadcast point between the session
//! state machine and consumers of sensor values. It is constructed explicitly
//! and cloned into whoever needs it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::ble::characteristics::ReadingKind;

/// Capacity of the broadcast channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// A single decoded sensor value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    /// What was measured.
    pub kind: ReadingKind,
    /// The value in the kind's unit.
    pub value: f64,
    /// When the value was decoded.
    pub received_at: DateTime<Utc>,
}

impl Reading {
    /// Create a reading stamped with the current time.
    pub fn new(kind: ReadingKind, value: f64) -> Self {
        Self {
            kind,
            value,
            received_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} {}", self.kind, self.value, self.kind.unit())
    }
}

/// Most recent value per kind. `None` means no reading has arrived yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadingSnapshot {
    /// Latest temperature in °C.
    pub temperature: Option<f64>,
    /// Latest pressure in hPa.
    pub pressure: Option<f64>,
    /// Latest relative humidity in %.
    pub humidity: Option<f64>,
    /// Latest CO2 concentration in ppm.
    pub co2: Option<f64>,
}

impl ReadingSnapshot {
    /// Get the latest value for a kind.
    pub fn get(&self, kind: ReadingKind) -> Option<f64> {
        match kind {
            ReadingKind::Temperature => self.temperature,
            ReadingKind::Pressure => self.pressure,
            ReadingKind::Humidity => self.humidity,
            ReadingKind::Co2 => self.co2,
        }
    }

    fn set(&mut self, kind: ReadingKind, value: f64) {
        let slot = match kind {
            ReadingKind::Temperature => &mut self.temperature,
            ReadingKind::Pressure => &mut self.pressure,
            ReadingKind::Humidity => &mut self.humidity,
            ReadingKind::Co2 => &mut self.co2,
        };
        *slot = Some(value);
    }
}

/// Handle for a registered subscriber callback.
///
/// The callback is removed when the handle is unregistered or dropped.
pub struct SubscriptionHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this subscriber.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the subscription ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}

struct Subscription {
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

struct PublisherInner {
    tx: broadcast::Sender<Reading>,
    latest: RwLock<ReadingSnapshot>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl PublisherInner {
    fn remove(&self, id: u64) -> bool {
        let removed = self.subscriptions.lock().remove(&id);
        match removed {
            Some(subscription) => {
                subscription.active.store(false, Ordering::SeqCst);
                subscription.task.abort();
                debug!("Subscriber {} unregistered", id);
                true
            }
            None => false,
        }
    }
}

/// Broadcasts decoded readings to any number of subscribers.
#[derive(Clone)]
pub struct ReadingPublisher {
    inner: Arc<PublisherInner>,
}

impl Default for ReadingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingPublisher {
    /// Create a publisher with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(PublisherInner {
                tx,
                latest: RwLock::new(ReadingSnapshot::default()),
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver a reading to every current subscriber.
    ///
    /// Never blocks; subscribers registered later do not see it.
    pub fn publish(&self, reading: Reading) {
        trace!("Publishing {}", reading);
        self.inner.latest.write().set(reading.kind, reading.value);
        // Err only means there are no receivers right now.
        let _ = self.inner.tx.send(reading);
    }

    /// Register a callback for future readings, optionally filtered to one kind.
    ///
    /// Each subscriber runs on its own task, so a slow callback never delays
    /// the others. Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, kind: Option<ReadingKind>, callback: F) -> SubscriptionHandle
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        // Receiver is created before spawning so nothing published after this
        // call returns can be missed.
        let mut rx = self.inner.tx.subscribe();
        let active = Arc::new(AtomicBool::new(true));
        let task_active = active.clone();

        // Held across the spawn so a callback that unregisters itself
        // straight away always finds its entry.
        let mut subscriptions = self.inner.subscriptions.lock();
        let task = tokio::spawn(async move {
            // The flag stops delivery even when the callback unregisters
            // itself and more readings are already queued.
            while task_active.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(reading) => {
                        if !task_active.load(Ordering::SeqCst) {
                            break;
                        }
                        if kind.map_or(true, |k| k == reading.kind) {
                            callback(reading);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber {} lagged, skipped {} readings", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        subscriptions.insert(id, Subscription { task, active });
        drop(subscriptions);
        debug!("Subscriber {} registered (filter: {:?})", id, kind);

        let inner: Weak<PublisherInner> = Arc::downgrade(&self.inner);
        SubscriptionHandle::new(id, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        })
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, mut handle: SubscriptionHandle) -> bool {
        // Disarm the drop hook; removal happens here instead.
        handle.unregister_fn = None;
        self.inner.remove(handle.id)
    }

    /// Get a raw receiver of every future reading.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<Reading> {
        self.inner.tx.subscribe()
    }

    /// Latest value for a kind, if any reading has been published.
    pub fn latest(&self, kind: ReadingKind) -> Option<f64> {
        self.inner.latest.read().get(kind)
    }

    /// Latest values for all kinds.
    pub fn snapshot(&self) -> ReadingSnapshot {
        *self.inner.latest.read()
    }

    /// Number of registered callback subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }
}

impl std::fmt::Debug for ReadingPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingPublisher")
            .field("subscribers", &self.subscriber_count())
            .field("latest", &self.snapshot())
            .finish()
    }
}
