//! Device side of the bus
//!
//! A [`DeviceNode`] behaves like ET-Bus firmware: it announces itself on
//! start, answers every hub ping with a pong, hands commands addressed to
//! its own id to the caller and publishes state reports. The `emulate`
//! command and the end-to-end tests run on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RECV_ERROR_BACKOFF;
use crate::hub::{ShutdownSignal, ShutdownTrigger};
use crate::protocol::{self, Envelope, MessageType, Payload};
use crate::transport::Transport;
use crate::{Error, Result};

/// Who a node claims to be
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: String,
    pub class: String,
    pub name: String,
    pub firmware: String,
    /// Signal strength reported in pongs, if any
    pub rssi: Option<i64>,
}

impl NodeIdentity {
    /// Identity named after its id with firmware `0.0.0`
    #[must_use]
    pub fn new(id: impl Into<String>, class: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            class: class.into(),
            firmware: "0.0.0".to_string(),
            rssi: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware = firmware.into();
        self
    }
}

struct NodeInner {
    identity: NodeIdentity,
    transport: Arc<dyn Transport>,
    booted: Instant,
    running: AtomicBool,
    shutdown: ShutdownTrigger,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A running device node; clones share one node
#[derive(Clone)]
pub struct DeviceNode {
    inner: Arc<NodeInner>,
}

impl DeviceNode {
    /// Open the transport, announce, and start answering the hub
    ///
    /// Returns the node and the stream of command payloads addressed to it.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be opened
    pub fn start(
        identity: NodeIdentity,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Payload>)> {
        transport.open()?;

        let node = Self {
            inner: Arc::new(NodeInner {
                identity,
                transport,
                booted: Instant::now(),
                running: AtomicBool::new(true),
                shutdown: ShutdownTrigger::new(),
                task: Mutex::new(None),
            }),
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(node_loop(node.clone(), commands_tx, node.inner.shutdown.signal()));
        *node.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        node.send_discover();
        node.send_pong();

        tracing::info!(
            id = %node.inner.identity.id,
            class = %node.inner.identity.class,
            "device node started"
        );
        Ok((node, commands_rx))
    }

    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Announce name and firmware
    pub fn send_discover(&self) {
        let identity = &self.inner.identity;
        let mut payload = Payload::new();
        payload.insert("name".to_string(), Value::from(identity.name.clone()));
        payload.insert("fw".to_string(), Value::from(identity.firmware.clone()));
        self.send(MessageType::Discover, payload);
    }

    /// Report uptime and signal strength
    pub fn send_pong(&self) {
        let mut payload = Payload::new();
        payload.insert(
            "uptime".to_string(),
            Value::from(self.inner.booted.elapsed().as_secs()),
        );
        if let Some(rssi) = self.inner.identity.rssi {
            payload.insert("rssi".to_string(), Value::from(rssi));
        }
        self.send(MessageType::Pong, payload);
    }

    /// Publish the endpoint's current state
    ///
    /// # Errors
    ///
    /// Returns `Error::NotStarted` once the node has stopped
    pub fn send_state(&self, payload: Payload) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::NotStarted);
        }
        self.send(MessageType::State, payload);
        Ok(())
    }

    /// Stop answering and close the transport; ends the command stream
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.trigger();
        self.inner.transport.close();

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "node task ended abnormally");
            }
        }
    }

    fn send(&self, kind: MessageType, payload: Payload) {
        let identity = &self.inner.identity;
        let envelope = Envelope::new(kind, &identity.id, &identity.class, payload);
        match protocol::encode(&envelope) {
            Ok(bytes) => self.inner.transport.send(&bytes),
            Err(e) => tracing::error!(%kind, error = %e, "failed to encode envelope"),
        }
    }

    fn handle(&self, envelope: Envelope, commands: &mpsc::UnboundedSender<Payload>) {
        match envelope.kind {
            MessageType::Ping => self.send_pong(),
            MessageType::Command if envelope.id == self.inner.identity.id => {
                tracing::debug!(id = %envelope.id, class = %envelope.class, "command received");
                // Receiver gone just means nobody acts on commands
                let _ = commands.send(envelope.payload);
            }
            _ => {}
        }
    }
}

async fn node_loop(
    node: DeviceNode,
    commands: mpsc::UnboundedSender<Payload>,
    mut shutdown: ShutdownSignal,
) {
    let transport = Arc::clone(&node.inner.transport);
    loop {
        let received = tokio::select! {
            () = shutdown.wait() => break,
            received = transport.recv() => received,
        };
        match received {
            Ok(Some(datagram)) => {
                if let Ok(envelope) = protocol::decode(&datagram.bytes) {
                    node.handle(envelope, &commands);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "node receive failed");
                tokio::select! {
                    () = shutdown.wait() => break,
                    () = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                }
            }
        }
    }
}
