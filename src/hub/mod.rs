//! Message bus: transport, registry and heartbeat behind one handle
//!
//! The receive loop and the heartbeat are spawned tasks. Every decoded
//! inbound envelope updates the registry, then goes to each subscriber's
//! own unbounded channel in receive order, so a slow subscriber never
//! stalls the loop.

mod heartbeat;
mod shutdown;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use shutdown::{ShutdownSignal, ShutdownTrigger};

use crate::config::{Config, HubConfig};
use crate::devices::{DeviceRecord, DeviceRegistry, LivenessTransition, RegistryUpdate};
use crate::protocol::{self, Envelope};
use crate::qos::{CommandSink, DeliveryEngine};
use crate::transport::{Datagram, MulticastTransport, Transport};
use crate::{Error, Result};

/// One decoded inbound envelope plus receive metadata
#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    /// The decoded envelope
    pub envelope: Envelope,
    /// Sender address
    pub source: SocketAddr,
    /// When the hub received it
    pub received_at: DateTime<Utc>,
}

/// Wall-clock time that advances with tokio's monotonic clock
///
/// Liveness then follows tokio's paused clock in tests and ignores wall
/// clock steps at runtime.
#[derive(Debug, Clone, Copy)]
struct BusClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl BusClock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.mono.elapsed())
            .ok()
            .and_then(|delta| self.wall.checked_add_signed(delta))
            .unwrap_or(self.wall)
    }
}

struct HubInner {
    config: HubConfig,
    transport: Arc<dyn Transport>,
    registry: RwLock<DeviceRegistry>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InboundMessage>>>,
    shutdown: ShutdownTrigger,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    clock: BusClock,
}

/// Handle to the bus; clones share one hub
///
/// Call [`Hub::stop`] before dropping the last handle, the spawned tasks
/// keep the hub alive until then.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub over any transport
    #[must_use]
    pub fn new(config: HubConfig, transport: Arc<dyn Transport>) -> Self {
        let registry = DeviceRegistry::with_own_id(config.id.clone());
        Self {
            inner: Arc::new(HubInner {
                config,
                transport,
                registry: RwLock::new(registry),
                subscribers: Mutex::new(Vec::new()),
                shutdown: ShutdownTrigger::new(),
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                clock: BusClock::new(),
            }),
        }
    }

    /// Create a hub on the UDP multicast transport
    #[must_use]
    pub fn multicast(config: &Config) -> Self {
        let transport = Arc::new(MulticastTransport::new(config.bus.clone()));
        Self::new(config.hub.clone(), transport)
    }

    /// Hub settings
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Whether `start` has run and `stop` has not
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Open the transport and spawn the receive loop and heartbeat
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyStarted` on a running hub, or the transport's
    /// error if it cannot be opened
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        if let Err(e) = inner.transport.open() {
            inner.running.store(false, Ordering::Release);
            return Err(e);
        }
        inner.shutdown.reset();

        let receiver = tokio::spawn(receive_loop(self.clone(), inner.shutdown.signal()));
        let heartbeat = tokio::spawn(heartbeat::run(self.clone(), inner.shutdown.signal()));
        lock(&inner.tasks).extend([receiver, heartbeat]);

        tracing::info!(
            id = %inner.config.id,
            ping_secs = inner.config.ping_interval.as_secs(),
            offline_secs = inner.config.offline_timeout.as_secs(),
            "hub started"
        );
        Ok(())
    }

    /// Stop both tasks, close the transport and end every subscription
    ///
    /// Delivery engines built with [`Hub::delivery_engine`] observe the
    /// shutdown and stop retrying. Calling this on a stopped hub is a no-op.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        inner.shutdown.trigger();
        inner.transport.close();

        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "hub task ended abnormally");
            }
        }
        lock(&inner.subscribers).clear();

        tracing::info!("hub stopped");
    }

    /// Encode and broadcast one envelope; failures are logged, not returned
    pub fn publish(&self, envelope: &Envelope) {
        match protocol::encode(envelope) {
            Ok(bytes) => self.inner.transport.send(&bytes),
            Err(e) => {
                tracing::error!(kind = %envelope.kind, id = %envelope.id, error = %e, "failed to encode envelope");
            }
        }
    }

    /// Send an envelope meant for one device
    ///
    /// The bus has no unicast path, so this broadcasts like [`Hub::publish`];
    /// the device recognises itself by the envelope's `id`.
    pub fn publish_to(&self, device_id: &str, envelope: &Envelope) {
        if tracing::enabled!(tracing::Level::TRACE) {
            let addr = self.device(device_id).map(|d| d.last_addr);
            tracing::trace!(device = %device_id, last_addr = ?addr, kind = %envelope.kind, "publish to device");
        }
        self.publish(envelope);
    }

    /// Broadcast a ping now, outside the heartbeat cadence
    pub fn ping(&self) {
        let config = &self.inner.config;
        let ping = Envelope::ping(&config.id, &config.class, self.inner.clock.now().timestamp());
        self.publish(&ping);
    }

    /// Register a listener for every envelope received from now on
    ///
    /// Closing the receiver unsubscribes on the next message.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Snapshot of every known device, ordered by identifier
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.read_registry().snapshot()
    }

    /// Snapshot of one device
    #[must_use]
    pub fn device(&self, id: &str) -> Option<DeviceRecord> {
        self.read_registry().get(id)
    }

    /// Re-evaluate liveness of every device against the offline timeout
    pub fn sweep_liveness(&self) -> Vec<LivenessTransition> {
        let now = self.inner.clock.now();
        let timeout = self.inner.config.offline_timeout;
        self.write_registry().sweep_liveness(now, timeout)
    }

    /// Signal that fires when this hub stops
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.signal()
    }

    /// Delivery engine for one endpoint, sending through this hub
    ///
    /// The engine uses the hub's QoS policy and stops retrying when the
    /// hub stops.
    #[must_use]
    pub fn delivery_engine(&self, device_id: &str, class: &str) -> DeliveryEngine {
        DeliveryEngine::builder(device_id, class, Arc::new(self.clone()))
            .policy(self.inner.config.qos.clone())
            .shutdown(self.shutdown_signal())
            .build()
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, DeviceRegistry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, DeviceRegistry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_datagram(&self, datagram: Datagram) {
        let envelope = match protocol::decode(&datagram.bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(source = %datagram.source, error = %e, "dropping datagram");
                return;
            }
        };

        let received_at = self.inner.clock.now();
        let update = self
            .write_registry()
            .update(&envelope, datagram.source.ip(), received_at);

        match update {
            RegistryUpdate::Created => {
                tracing::info!(
                    device = %envelope.id,
                    class = %envelope.class,
                    addr = %datagram.source.ip(),
                    "new device"
                );
            }
            RegistryUpdate::Updated { came_online: true } => {
                tracing::info!(device = %envelope.id, "device back online");
            }
            RegistryUpdate::Updated { came_online: false } => {}
            RegistryUpdate::Ignored(reason) => {
                tracing::trace!(device = %envelope.id, ?reason, "not admitted to registry");
            }
        }

        let message = InboundMessage {
            envelope,
            source: datagram.source,
            received_at,
        };
        lock(&self.inner.subscribers).retain(|tx| tx.send(message.clone()).is_ok());
    }
}

impl CommandSink for Hub {
    fn send_command(&self, envelope: &Envelope) {
        self.publish_to(&envelope.id, envelope);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn receive_loop(hub: Hub, mut shutdown: ShutdownSignal) {
    let transport = Arc::clone(&hub.inner.transport);
    let backoff = hub.inner.config.recv_error_backoff;

    loop {
        let received = tokio::select! {
            () = shutdown.wait() => break,
            received = transport.recv() => received,
        };

        match received {
            Ok(Some(datagram)) => hub.handle_datagram(datagram),
            Ok(None) => {
                tracing::debug!("transport closed, receive loop exiting");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "receive failed");
                tokio::select! {
                    () = shutdown.wait() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
