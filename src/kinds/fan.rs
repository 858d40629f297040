//! Fans: percentage (`fan.speed`) or preset (`fan.preset`)

use serde::Serialize;
use serde_json::Value;

use super::{EndpointInfo, as_u8_clamped, truthy};
use crate::protocol::Payload;
use crate::qos::DeliveryEngine;
use crate::{Error, Result};

/// Modes a `fan.preset` endpoint accepts
pub const PRESET_MODES: [&str; 4] = ["off", "low", "medium", "high"];

/// How the fan is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FanMode {
    /// `speed` as 0..=100 percent
    Speed,
    /// Named `preset`
    Preset,
}

impl FanMode {
    #[must_use]
    pub fn for_class(class: &str) -> Option<Self> {
        match class {
            "fan.speed" => Some(Self::Speed),
            "fan.preset" => Some(Self::Preset),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Fan {
    info: EndpointInfo,
    mode: FanMode,
    is_on: bool,
    percentage: u8,
    preset: Option<String>,
    engine: DeliveryEngine,
}

impl Fan {
    #[must_use]
    pub fn new(info: EndpointInfo, mode: FanMode, engine: DeliveryEngine) -> Self {
        Self {
            info,
            mode,
            is_on: false,
            percentage: 0,
            preset: None,
            engine,
        }
    }

    #[must_use]
    pub const fn info(&self) -> &EndpointInfo {
        &self.info
    }

    #[must_use]
    pub const fn mode(&self) -> FanMode {
        self.mode
    }

    #[must_use]
    pub const fn is_on(&self) -> bool {
        self.is_on
    }

    /// Speed percentage; `None` for preset fans
    #[must_use]
    pub fn percentage(&self) -> Option<u8> {
        (self.mode == FanMode::Speed).then_some(self.percentage)
    }

    /// Current preset; `None` for speed fans or before the first report
    #[must_use]
    pub fn preset(&self) -> Option<&str> {
        match self.mode {
            FanMode::Preset => self.preset.as_deref(),
            FanMode::Speed => None,
        }
    }

    #[must_use]
    pub const fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    pub fn handle_state(&mut self, payload: &Payload) {
        if let Some(on) = payload.get("on") {
            self.is_on = truthy(on);
        }
        match self.mode {
            FanMode::Speed => {
                if let Some(speed) = payload.get("speed").and_then(|v| as_u8_clamped(v, 100)) {
                    self.percentage = speed;
                }
            }
            FanMode::Preset => {
                if let Some(preset) = payload.get("preset") {
                    self.preset = Some(match preset {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                }
            }
        }

        self.engine.on_observed_state(payload);
    }

    /// Set speed; zero turns the fan off
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidCommand` on a preset fan
    pub fn set_percentage(&mut self, percentage: u8) -> Result<()> {
        if self.mode != FanMode::Speed {
            return Err(Error::InvalidCommand(format!(
                "{} has no speed control",
                self.info.unique_id()
            )));
        }
        self.percentage = percentage.min(100);
        self.is_on = self.percentage > 0;
        self.send();
        Ok(())
    }

    /// Select a preset; `off` turns the fan off
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidCommand` on a speed fan or for an unknown mode
    pub fn set_preset(&mut self, preset: &str) -> Result<()> {
        if self.mode != FanMode::Preset {
            return Err(Error::InvalidCommand(format!(
                "{} has no presets",
                self.info.unique_id()
            )));
        }
        if !PRESET_MODES.contains(&preset) {
            return Err(Error::InvalidCommand(format!(
                "unknown preset {preset:?}, expected one of {PRESET_MODES:?}"
            )));
        }
        self.preset = Some(preset.to_string());
        self.is_on = preset != "off";
        self.send();
        Ok(())
    }

    /// Turn on at the current speed or preset
    pub fn turn_on(&mut self) {
        self.is_on = true;
        self.send();
    }

    pub fn turn_off(&mut self) {
        self.is_on = false;
        match self.mode {
            FanMode::Speed => self.percentage = 0,
            FanMode::Preset => self.preset = Some("off".to_string()),
        }
        self.send();
    }

    fn desired(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("on".to_string(), Value::Bool(self.is_on));
        match self.mode {
            FanMode::Speed => {
                payload.insert("speed".to_string(), Value::from(self.percentage));
            }
            FanMode::Preset => {
                payload.insert(
                    "preset".to_string(),
                    self.preset.clone().map_or(Value::Null, Value::String),
                );
            }
        }
        payload
    }

    fn send(&self) {
        self.engine.request_delivery(self.desired());
    }
}
