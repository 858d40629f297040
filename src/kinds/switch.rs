//! On/off switches: `switch.relay` and `switch.pump`

use serde_json::Value;

use super::{EndpointInfo, truthy};
use crate::protocol::Payload;
use crate::qos::DeliveryEngine;

/// A relay or pump output
#[derive(Debug)]
pub struct Switch {
    info: EndpointInfo,
    is_on: bool,
    attributes: Payload,
    engine: DeliveryEngine,
}

impl Switch {
    #[must_use]
    pub fn new(info: EndpointInfo, engine: DeliveryEngine) -> Self {
        Self {
            info,
            is_on: false,
            attributes: Payload::new(),
            engine,
        }
    }

    #[must_use]
    pub const fn info(&self) -> &EndpointInfo {
        &self.info
    }

    #[must_use]
    pub const fn is_on(&self) -> bool {
        self.is_on
    }

    /// Extra keys from the last state report, `on` excluded
    #[must_use]
    pub const fn attributes(&self) -> &Payload {
        &self.attributes
    }

    #[must_use]
    pub const fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Apply a state report and offer it to the engine as confirmation
    pub fn handle_state(&mut self, payload: &Payload) {
        if let Some(on) = payload.get("on") {
            self.is_on = truthy(on);
        }
        let mut extra = payload.clone();
        extra.remove("on");
        self.attributes = extra;

        self.engine.on_observed_state(payload);
    }

    pub fn turn_on(&mut self) {
        self.set(true);
    }

    pub fn turn_off(&mut self) {
        self.set(false);
    }

    fn set(&mut self, on: bool) {
        self.is_on = on;
        let mut desired = Payload::new();
        desired.insert("on".to_string(), Value::Bool(on));
        self.engine.request_delivery(desired);
    }
}
