//! Observe-only sensors (`sensor.*`)
//!
//! A state payload with a `value` key is one metric named after the class
//! suffix (`sensor.temp` gives `temp`). Otherwise every scalar key except
//! `unit` is its own metric, so `{"temp": 21.5, "humidity": 40}` from
//! `sensor.env` yields two readings.

use serde::Serialize;
use serde_json::Value;

use super::endpoint_name;
use crate::protocol::Payload;

/// Latest value of one metric on one sensor endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub device_id: String,
    pub class: String,
    pub metric: String,
    pub value: Value,
    /// First `unit` the device reported for this metric
    pub unit: Option<String>,
}

impl SensorReading {
    /// `etbus_<device id>_<endpoint name>_<metric>`
    #[must_use]
    pub fn unique_id(&self) -> String {
        sensor_unique_id(&self.device_id, &self.class, &self.metric)
    }

    /// Take a new value, keeping the first reported unit
    pub fn update(&mut self, value: Value, unit: Option<&str>) {
        self.value = value;
        if self.unit.is_none() {
            self.unit = unit.map(str::to_string);
        }
    }
}

#[must_use]
pub fn sensor_unique_id(device_id: &str, class: &str, metric: &str) -> String {
    format!("etbus_{device_id}_{}_{metric}", endpoint_name(class))
}

/// Split a state payload into `(metric, value)` pairs
#[must_use]
pub fn metrics(class: &str, payload: &Payload) -> Vec<(String, Value)> {
    if let Some(value) = payload.get("value") {
        let metric = match class.strip_prefix("sensor.") {
            Some("") | None => "value",
            Some(suffix) => suffix,
        };
        return vec![(metric.to_string(), value.clone())];
    }

    payload
        .iter()
        .filter(|(key, value)| {
            key.as_str() != "unit"
                && !matches!(value, Value::Null | Value::Array(_) | Value::Object(_))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn single_value_is_named_after_class() {
        let got = metrics("sensor.temp", &payload(json!({"value": 21.5, "unit": "C"})));
        assert_eq!(got, vec![("temp".to_string(), json!(21.5))]);

        let got = metrics("sensor.", &payload(json!({"value": 3})));
        assert_eq!(got[0].0, "value");
    }

    #[test]
    fn multi_metric_skips_unit_and_non_scalars() {
        let got = metrics(
            "sensor.env",
            &payload(json!({"temp": 20, "humidity": 41, "unit": "mixed", "raw": [1, 2], "meta": {}, "err": null})),
        );
        let names: Vec<_> = got.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, ["humidity", "temp"]);
    }

    #[test]
    fn first_unit_sticks() {
        let mut reading = SensorReading {
            device_id: "s1".to_string(),
            class: "sensor.co2".to_string(),
            metric: "co2".to_string(),
            value: json!(400),
            unit: None,
        };
        reading.update(json!(410), Some("ppm"));
        reading.update(json!(420), Some("ppb"));
        assert_eq!(reading.value, json!(420));
        assert_eq!(reading.unit.as_deref(), Some("ppm"));
        assert_eq!(reading.unique_id(), "etbus_s1_sensor_co2_co2");
    }
}
