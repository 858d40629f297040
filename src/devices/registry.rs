//! Registry of devices heard on the bus

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{DeviceRecord, IgnoreReason, LivenessTransition, RegistryUpdate};
use crate::protocol::{Envelope, HUB_ID, MessageType};

/// Device identifier → last-known metadata
///
/// Records are never removed; a silent device stays in the registry marked
/// offline until the process restarts.
///
/// Messages carrying [`HUB_ID`] or the owning hub's own identifier are
/// never admitted.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceRecord>,
    own_id: Option<String>,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry for a hub publishing as `own_id`
    #[must_use]
    pub fn with_own_id(own_id: impl Into<String>) -> Self {
        Self {
            devices: HashMap::new(),
            own_id: Some(own_id.into()),
        }
    }

    fn is_own(&self, id: &str) -> bool {
        id == HUB_ID || self.own_id.as_deref() == Some(id)
    }

    /// Admit or refresh the sender of `envelope`
    pub fn update(
        &mut self,
        envelope: &Envelope,
        source: IpAddr,
        now: DateTime<Utc>,
    ) -> RegistryUpdate {
        if !envelope.is_current_version() {
            return RegistryUpdate::Ignored(IgnoreReason::VersionMismatch);
        }
        if envelope.id.is_empty() {
            return RegistryUpdate::Ignored(IgnoreReason::MissingId);
        }
        if self.is_own(&envelope.id) {
            return RegistryUpdate::Ignored(IgnoreReason::HubOrigin);
        }

        let payload = &envelope.payload;
        let class = (!envelope.class.is_empty()).then(|| envelope.class.clone());

        let result = if let Some(dev) = self.devices.get_mut(&envelope.id) {
            let came_online = !dev.online;
            if class.is_some() {
                dev.class = class;
            }
            if let Some(name) = envelope.payload_str("name") {
                dev.name = name.to_string();
            }
            if let Some(fw) = payload.get("fw") {
                dev.firmware = value_text(fw);
            }
            dev.last_addr = source;
            dev.last_seen = now;
            dev.online = true;
            RegistryUpdate::Updated { came_online }
        } else {
            let record = DeviceRecord {
                id: envelope.id.clone(),
                class,
                name: envelope
                    .payload_str("name")
                    .unwrap_or(envelope.id.as_str())
                    .to_string(),
                firmware: payload.get("fw").and_then(value_text),
                last_addr: source,
                last_seen: now,
                online: true,
                uptime: None,
                rssi: None,
            };
            self.devices.insert(envelope.id.clone(), record);
            RegistryUpdate::Created
        };

        if envelope.kind == MessageType::Pong {
            if let Some(dev) = self.devices.get_mut(&envelope.id) {
                if let Some(uptime) = payload.get("uptime").and_then(Value::as_u64) {
                    dev.uptime = Some(uptime);
                }
                if let Some(rssi) = payload.get("rssi").and_then(Value::as_i64) {
                    dev.rssi = Some(rssi);
                }
            }
        }

        result
    }

    /// Recompute liveness for every record and return the flips
    pub fn sweep_liveness(
        &mut self,
        now: DateTime<Utc>,
        offline_timeout: Duration,
    ) -> Vec<LivenessTransition> {
        let mut transitions = Vec::new();

        for dev in self.devices.values_mut() {
            // A last_seen in the future (clock stepped back) counts as fresh
            let silent_for = (now - dev.last_seen).to_std().unwrap_or_default();
            let online = silent_for < offline_timeout;
            if online != dev.online {
                dev.online = online;
                transitions.push(LivenessTransition {
                    id: dev.id.clone(),
                    online,
                    silent_for,
                });
            }
        }

        transitions.sort_by(|a, b| a.id.cmp(&b.id));
        transitions
    }

    /// Copy of one record
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.get(id).cloned()
    }

    /// Copy of every record, ordered by identifier
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Number of known devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has been heard yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Firmware versions arrive as strings or bare numbers
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::protocol::{Payload, decode};

    fn envelope(kind: &str, id: &str, class: &str, payload: serde_json::Value) -> Envelope {
        let raw = json!({"v": 1, "type": kind, "id": id, "class": class, "payload": payload});
        decode(raw.to_string().as_bytes()).unwrap()
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    #[test]
    fn first_message_creates_online_record() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();
        let env = envelope("discover", "relay-01", "switch.relay", json!({"name": "Pump", "fw": "1.2"}));

        assert_eq!(registry.update(&env, addr(10), now), RegistryUpdate::Created);

        let dev = registry.get("relay-01").unwrap();
        assert_eq!(dev.name, "Pump");
        assert_eq!(dev.class.as_deref(), Some("switch.relay"));
        assert_eq!(dev.firmware.as_deref(), Some("1.2"));
        assert_eq!(dev.last_addr, addr(10));
        assert!(dev.online);
    }

    #[test]
    fn configured_hub_id_is_never_admitted() {
        let mut registry = DeviceRegistry::with_own_id("kitchen-hub");
        let now = Utc::now();

        for id in ["kitchen-hub", "hub"] {
            let update = registry.update(&envelope("ping", id, "hub", json!({"ts": 1})), addr(2), now);
            assert_eq!(update, RegistryUpdate::Ignored(IgnoreReason::HubOrigin));
        }
        assert!(registry.is_empty());

        registry.update(&envelope("pong", "relay-01", "switch.relay", json!({})), addr(3), now);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn name_defaults_to_id_and_is_kept_on_update() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();

        registry.update(&envelope("state", "fan-1", "fan.speed", json!({})), addr(1), now);
        assert_eq!(registry.get("fan-1").unwrap().name, "fan-1");

        registry.update(&envelope("discover", "fan-1", "fan.speed", json!({"name": "Attic"})), addr(1), now);
        registry.update(&envelope("state", "fan-1", "", json!({"speed": 20})), addr(2), now);

        let dev = registry.get("fan-1").unwrap();
        assert_eq!(dev.name, "Attic");
        assert_eq!(dev.class.as_deref(), Some("fan.speed"), "empty class keeps previous");
        assert_eq!(dev.last_addr, addr(2));
    }

    #[test]
    fn firmware_only_changes_when_reported() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();

        registry.update(&envelope("discover", "a", "x.y", json!({"fw": 7})), addr(1), now);
        assert_eq!(registry.get("a").unwrap().firmware.as_deref(), Some("7"));

        registry.update(&envelope("state", "a", "x.y", json!({"on": true})), addr(1), now);
        assert_eq!(registry.get("a").unwrap().firmware.as_deref(), Some("7"));

        registry.update(&envelope("discover", "a", "x.y", json!({"fw": "2.0.1"})), addr(1), now);
        assert_eq!(registry.get("a").unwrap().firmware.as_deref(), Some("2.0.1"));
    }

    #[test]
    fn pong_captures_telemetry() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();

        registry.update(&envelope("pong", "a", "x.y", json!({"uptime": 3600, "rssi": -61})), addr(1), now);
        let dev = registry.get("a").unwrap();
        assert_eq!(dev.uptime, Some(3600));
        assert_eq!(dev.rssi, Some(-61));

        // Non-pong messages carrying the same keys don't touch telemetry
        registry.update(&envelope("state", "a", "x.y", json!({"uptime": 1, "rssi": 0})), addr(1), now);
        let dev = registry.get("a").unwrap();
        assert_eq!(dev.uptime, Some(3600));
        assert_eq!(dev.rssi, Some(-61));
    }

    #[test]
    fn hub_is_never_admitted() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();

        for kind in ["discover", "state", "command", "ping", "pong", "something_new"] {
            let env = envelope(kind, "hub", "hub", json!({}));
            assert_eq!(
                registry.update(&env, addr(1), now),
                RegistryUpdate::Ignored(IgnoreReason::HubOrigin)
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn missing_id_and_wrong_version_are_ignored() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();

        let no_id = Envelope::new(MessageType::State, "", "switch.relay", Payload::new());
        assert_eq!(
            registry.update(&no_id, addr(1), now),
            RegistryUpdate::Ignored(IgnoreReason::MissingId)
        );

        let mut old = Envelope::state("a", "switch.relay", Payload::new());
        old.version = 0;
        assert_eq!(
            registry.update(&old, addr(1), now),
            RegistryUpdate::Ignored(IgnoreReason::VersionMismatch)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_flips_offline_once_and_message_restores_online() {
        let mut registry = DeviceRegistry::new();
        let t0 = Utc::now();
        let timeout = Duration::from_secs(60);
        let env = envelope("state", "a", "x.y", json!({}));

        registry.update(&env, addr(1), t0);

        assert!(registry.sweep_liveness(t0 + TimeDelta::seconds(30), timeout).is_empty());

        let flips = registry.sweep_liveness(t0 + TimeDelta::seconds(60), timeout);
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].id, "a");
        assert!(!flips[0].online);
        assert_eq!(flips[0].silent_for, Duration::from_secs(60));
        assert!(!registry.get("a").unwrap().online);

        // Already offline: later sweeps report nothing
        assert!(registry.sweep_liveness(t0 + TimeDelta::seconds(90), timeout).is_empty());

        // Next inbound message restores liveness without waiting for a sweep
        let update = registry.update(&env, addr(1), t0 + TimeDelta::seconds(95));
        assert_eq!(update, RegistryUpdate::Updated { came_online: true });
        assert!(registry.get("a").unwrap().online);
    }

    #[test]
    fn sweep_can_flip_back_online() {
        let mut registry = DeviceRegistry::new();
        let t0 = Utc::now();
        let timeout = Duration::from_secs(60);
        registry.update(&envelope("state", "a", "x.y", json!({})), addr(1), t0);

        // Force offline, then a sweep against an earlier "now" sees it fresh
        registry.sweep_liveness(t0 + TimeDelta::seconds(120), timeout);
        let flips = registry.sweep_liveness(t0 + TimeDelta::seconds(10), timeout);
        assert_eq!(flips.len(), 1);
        assert!(flips[0].online);
    }

    #[test]
    fn snapshot_is_a_detached_copy() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();
        registry.update(&envelope("state", "b", "x.y", json!({})), addr(1), now);
        registry.update(&envelope("state", "a", "x.y", json!({})), addr(1), now);

        let mut snapshot = registry.snapshot();
        assert_eq!(snapshot.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        snapshot[0].name = "changed".to_string();
        assert_eq!(registry.get("a").unwrap().name, "a");
    }
}
