//! Shared test utilities

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use etbus::protocol::decode;
use etbus::transport::Datagram;
use etbus::{Envelope, Hub, HubConfig, InboundMessage, MemoryBus, Payload};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

/// Start a hub with default settings on `bus`
#[must_use]
pub fn start_hub(bus: &MemoryBus) -> Hub {
    start_hub_with(bus, HubConfig::default())
}

/// Start a hub with custom settings on `bus`
#[must_use]
pub fn start_hub_with(bus: &MemoryBus, config: HubConfig) -> Hub {
    let hub = Hub::new(config, Arc::new(bus.transport()));
    hub.start().expect("failed to start hub");
    hub
}

/// Address a fake device sends from
#[must_use]
pub fn device_addr(last: u8) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, last], 5555))
}

/// Wire bytes for a v1 envelope
#[must_use]
pub fn raw(kind: &str, id: &str, class: &str, payload: Value) -> String {
    json!({"v": 1, "type": kind, "id": id, "class": class, "payload": payload}).to_string()
}

/// Payload from a JSON object literal
#[must_use]
pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

/// Next message on a subscription, failing the test after a second
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription closed")
}

/// Drain a bus tap into decoded envelopes, skipping anything undecodable
pub fn drain_tap(tap: &mut broadcast::Receiver<Datagram>) -> Vec<Envelope> {
    std::iter::from_fn(|| tap.try_recv().ok())
        .filter_map(|d| decode(&d.bytes).ok())
        .collect()
}
