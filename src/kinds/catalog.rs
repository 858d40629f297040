//! Endpoint discovery and ownership

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;

use super::fan::{Fan, FanMode};
use super::light::Light;
use super::sensor::{SensorReading, metrics, sensor_unique_id};
use super::switch::Switch;
use super::{EndpointInfo, EndpointKind};
use crate::hub::{Hub, InboundMessage};
use crate::protocol::{Envelope, MessageType};
use crate::qos::DeliveryEngine;

/// A controllable endpoint
#[derive(Debug)]
pub enum Endpoint {
    Switch(Switch),
    Fan(Fan),
    Light(Light),
}

impl Endpoint {
    #[must_use]
    pub const fn info(&self) -> &EndpointInfo {
        match self {
            Self::Switch(s) => s.info(),
            Self::Fan(f) => f.info(),
            Self::Light(l) => l.info(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EndpointKind {
        match self {
            Self::Switch(_) => EndpointKind::Switch,
            Self::Fan(_) => EndpointKind::Fan,
            Self::Light(_) => EndpointKind::Light,
        }
    }

    #[must_use]
    pub const fn engine(&self) -> &DeliveryEngine {
        match self {
            Self::Switch(s) => s.engine(),
            Self::Fan(f) => f.engine(),
            Self::Light(l) => l.engine(),
        }
    }

    #[must_use]
    pub const fn is_on(&self) -> bool {
        match self {
            Self::Switch(s) => s.is_on(),
            Self::Fan(f) => f.is_on(),
            Self::Light(l) => l.is_on(),
        }
    }

    fn handle_state(&mut self, envelope: &Envelope) {
        match self {
            Self::Switch(s) => s.handle_state(&envelope.payload),
            Self::Fan(f) => f.handle_state(&envelope.payload),
            Self::Light(l) => l.handle_state(&envelope.payload),
        }
    }
}

/// What one message changed in the catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum CatalogChange {
    /// New controllable endpoint
    EndpointAdded {
        unique_id: String,
        kind: EndpointKind,
        name: String,
    },
    /// New sensor metric
    SensorAdded { unique_id: String },
    /// Existing endpoint took a state report
    StateUpdated { unique_id: String },
}

/// Every endpoint discovered on the bus
///
/// Controllable endpoints appear on `discover`, `state` or `pong` for
/// their class and take `state` payloads as they arrive. Sensor metrics
/// appear on their first `state`. Endpoints are never removed.
pub struct Catalog {
    hub: Hub,
    endpoints: BTreeMap<(String, String), Endpoint>,
    sensors: BTreeMap<String, SensorReading>,
}

impl Catalog {
    /// Empty catalog whose engines send through `hub`
    #[must_use]
    pub const fn new(hub: Hub) -> Self {
        Self {
            hub,
            endpoints: BTreeMap::new(),
            sensors: BTreeMap::new(),
        }
    }

    /// Feed one inbound envelope
    pub fn handle(&mut self, envelope: &Envelope) -> Vec<CatalogChange> {
        if envelope.id.is_empty() || !envelope.is_current_version() {
            return Vec::new();
        }
        match EndpointKind::for_class(&envelope.class) {
            Some(EndpointKind::Sensor) => self.handle_sensor(envelope),
            Some(kind) => self.handle_controllable(kind, envelope),
            None => Vec::new(),
        }
    }

    /// Consume a hub subscription until it closes
    pub async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = rx.recv().await {
            for change in self.handle(&message.envelope) {
                match change {
                    CatalogChange::EndpointAdded { unique_id, kind, name } => {
                        tracing::info!(endpoint = %unique_id, ?kind, name = %name, "endpoint discovered");
                    }
                    CatalogChange::SensorAdded { unique_id } => {
                        tracing::info!(sensor = %unique_id, "sensor discovered");
                    }
                    CatalogChange::StateUpdated { unique_id } => {
                        tracing::debug!(endpoint = %unique_id, "state updated");
                    }
                }
            }
        }
        tracing::debug!("catalog subscription closed");
    }

    #[must_use]
    pub fn endpoint(&self, device_id: &str, class: &str) -> Option<&Endpoint> {
        self.endpoints.get(&(device_id.to_string(), class.to_string()))
    }

    pub fn endpoint_mut(&mut self, device_id: &str, class: &str) -> Option<&mut Endpoint> {
        self.endpoints
            .get_mut(&(device_id.to_string(), class.to_string()))
    }

    /// Controllable endpoints ordered by device id then class
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    #[must_use]
    pub fn sensor(&self, device_id: &str, class: &str, metric: &str) -> Option<&SensorReading> {
        self.sensors.get(&sensor_unique_id(device_id, class, metric))
    }

    /// Sensor readings ordered by unique id
    pub fn sensors(&self) -> impl Iterator<Item = &SensorReading> {
        self.sensors.values()
    }

    /// Cancel every pending delivery
    pub fn stop(&self) {
        for endpoint in self.endpoints.values() {
            endpoint.engine().stop();
        }
    }

    fn handle_controllable(&mut self, kind: EndpointKind, envelope: &Envelope) -> Vec<CatalogChange> {
        if !matches!(
            envelope.kind,
            MessageType::Discover | MessageType::State | MessageType::Pong
        ) {
            return Vec::new();
        }

        let mut changes = Vec::new();
        let key = (envelope.id.clone(), envelope.class.clone());

        if !self.endpoints.contains_key(&key) {
            let name = envelope.payload_str("name").unwrap_or(envelope.id.as_str());
            let info = EndpointInfo::new(&envelope.id, &envelope.class, name);
            let engine = self.hub.delivery_engine(&envelope.id, &envelope.class);
            let endpoint = match kind {
                EndpointKind::Switch => Endpoint::Switch(Switch::new(info, engine)),
                EndpointKind::Light => Endpoint::Light(Light::new(info, engine)),
                EndpointKind::Fan => {
                    let mode = FanMode::for_class(&envelope.class).unwrap_or(FanMode::Speed);
                    Endpoint::Fan(Fan::new(info, mode, engine))
                }
                EndpointKind::Sensor => return changes,
            };
            changes.push(CatalogChange::EndpointAdded {
                unique_id: endpoint.info().unique_id(),
                kind,
                name: endpoint.info().name.clone(),
            });
            self.endpoints.insert(key.clone(), endpoint);
        }

        if envelope.kind == MessageType::State {
            if let Some(endpoint) = self.endpoints.get_mut(&key) {
                endpoint.handle_state(envelope);
                changes.push(CatalogChange::StateUpdated {
                    unique_id: endpoint.info().unique_id(),
                });
            }
        }
        changes
    }

    fn handle_sensor(&mut self, envelope: &Envelope) -> Vec<CatalogChange> {
        if envelope.kind != MessageType::State {
            return Vec::new();
        }

        let unit = envelope.payload_str("unit");
        let mut changes = Vec::new();

        for (metric, value) in metrics(&envelope.class, &envelope.payload) {
            let unique_id = sensor_unique_id(&envelope.id, &envelope.class, &metric);
            if let Some(reading) = self.sensors.get_mut(&unique_id) {
                reading.update(value, unit);
            } else {
                self.sensors.insert(
                    unique_id.clone(),
                    SensorReading {
                        device_id: envelope.id.clone(),
                        class: envelope.class.clone(),
                        metric,
                        value,
                        unit: unit.map(str::to_string),
                    },
                );
                changes.push(CatalogChange::SensorAdded { unique_id });
            }
        }
        changes
    }
}
