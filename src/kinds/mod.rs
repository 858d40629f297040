//! Device-kind adapters
//!
//! Each adapter shapes one family of endpoint classes into local state and
//! desired-state commands, using only the hub's subscribe stream and a
//! per-endpoint [`crate::qos::DeliveryEngine`]. The [`Catalog`] discovers
//! endpoints from bus traffic and owns them.
//!
//! | Class                          | Adapter              |
//! |--------------------------------|----------------------|
//! | `switch.relay`, `switch.pump`  | [`Switch`]           |
//! | `fan.speed`, `fan.preset`      | [`Fan`]              |
//! | `light.rgb`                    | [`Light`]            |
//! | `sensor.*`                     | [`SensorReading`]    |

pub mod catalog;
pub mod fan;
pub mod light;
pub mod sensor;
pub mod switch;

use serde::Serialize;
use serde_json::Value;

pub use catalog::{Catalog, CatalogChange, Endpoint};
pub use fan::{Fan, FanMode, PRESET_MODES};
pub use light::Light;
pub use sensor::SensorReading;
pub use switch::Switch;

/// Adapter family for a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Switch,
    Fan,
    Light,
    Sensor,
}

impl EndpointKind {
    /// Adapter for `class`, `None` for classes no adapter handles
    #[must_use]
    pub fn for_class(class: &str) -> Option<Self> {
        match class {
            "switch.relay" | "switch.pump" => Some(Self::Switch),
            "fan.speed" | "fan.preset" => Some(Self::Fan),
            "light.rgb" => Some(Self::Light),
            c if c.starts_with("sensor.") => Some(Self::Sensor),
            _ => None,
        }
    }
}

/// Identity shared by every endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub device_id: String,
    pub class: String,
    /// Display name from the first message, or the device id
    pub name: String,
}

impl EndpointInfo {
    #[must_use]
    pub fn new(device_id: impl Into<String>, class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            class: class.into(),
            name: name.into(),
        }
    }

    /// Stable id that survives restarts
    #[must_use]
    pub fn unique_id(&self) -> String {
        unique_id(&self.device_id, &self.class)
    }
}

/// Class with dots replaced, e.g. `switch_relay`
#[must_use]
pub fn endpoint_name(class: &str) -> String {
    class.replace('.', "_")
}

/// `etbus_<device id>_<endpoint name>`
#[must_use]
pub fn unique_id(device_id: &str, class: &str) -> String {
    format!("etbus_{device_id}_{}", endpoint_name(class))
}

/// Loose truthiness for firmware-reported flags
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Integer from a number or numeric string, fractions truncated
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// [`as_int`] clamped into `0..=max`
pub(crate) fn as_u8_clamped(value: &Value, max: u8) -> Option<u8> {
    as_int(value).map(|v| u8::try_from(v.clamp(0, i64::from(max))).unwrap_or(max))
}
