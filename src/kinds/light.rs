//! RGB lights (`light.rgb`)

use serde_json::Value;

use super::{EndpointInfo, as_u8_clamped, truthy};
use crate::protocol::Payload;
use crate::qos::DeliveryEngine;

const WHITE: [u8; 3] = [255, 255, 255];

#[derive(Debug)]
pub struct Light {
    info: EndpointInfo,
    is_on: bool,
    rgb: [u8; 3],
    brightness: u8,
    engine: DeliveryEngine,
}

impl Light {
    /// Starts off, white, full brightness
    #[must_use]
    pub fn new(info: EndpointInfo, engine: DeliveryEngine) -> Self {
        Self {
            info,
            is_on: false,
            rgb: WHITE,
            brightness: u8::MAX,
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

    #[must_use]
    pub const fn rgb(&self) -> [u8; 3] {
        self.rgb
    }

    #[must_use]
    pub const fn brightness(&self) -> u8 {
        self.brightness
    }

    #[must_use]
    pub const fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Apply a state report; a colour only counts when all of `r`, `g`, `b` are present
    pub fn handle_state(&mut self, payload: &Payload) {
        if let Some(on) = payload.get("on") {
            self.is_on = truthy(on);
        }
        let channel = |key: &str| payload.get(key).and_then(|v| as_u8_clamped(v, u8::MAX));
        if let (Some(r), Some(g), Some(b)) = (channel("r"), channel("g"), channel("b")) {
            self.rgb = [r, g, b];
        }
        if let Some(brightness) = channel("brightness") {
            self.brightness = brightness;
        }

        self.engine.on_observed_state(payload);
    }

    /// Turn on, optionally changing colour and brightness
    pub fn turn_on(&mut self, rgb: Option<[u8; 3]>, brightness: Option<u8>) {
        if let Some(rgb) = rgb {
            self.rgb = rgb;
        }
        if let Some(brightness) = brightness {
            self.brightness = brightness;
        }
        self.is_on = true;
        self.send();
    }

    /// Turn off, keeping colour and brightness for the next turn on
    pub fn turn_off(&mut self) {
        self.is_on = false;
        self.send();
    }

    fn send(&self) {
        let [r, g, b] = self.rgb;
        let mut desired = Payload::new();
        desired.insert("on".to_string(), Value::Bool(self.is_on));
        desired.insert("r".to_string(), Value::from(r));
        desired.insert("g".to_string(), Value::from(g));
        desired.insert("b".to_string(), Value::from(b));
        desired.insert("brightness".to_string(), Value::from(self.brightness));
        self.engine.request_delivery(desired);
    }
}
