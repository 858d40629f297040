//! Retry timing and confirmation matching for QoS delivery

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::protocol::Payload;
use crate::{Error, Result};

/// Delay before each retry: 0ms, 40ms, 80ms, 150ms, 300ms, 600ms, then 1s
pub const QOS_RETRY_DELAYS: [Duration; 7] = [
    Duration::from_millis(0),
    Duration::from_millis(40),
    Duration::from_millis(80),
    Duration::from_millis(150),
    Duration::from_millis(300),
    Duration::from_millis(600),
    Duration::from_millis(1000),
];

/// Total time budget for one command before it is reported as failed
pub const QOS_MAX_TOTAL: Duration = Duration::from_millis(2000);

/// Timing for a bounded retry sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosPolicy {
    /// Delay table indexed by attempts sent so far; the last entry repeats
    pub retry_delays: Vec<Duration>,
    /// Sequence is abandoned once this much time has passed since the first send
    pub max_total: Duration,
}

impl Default for QosPolicy {
    fn default() -> Self {
        Self {
            retry_delays: QOS_RETRY_DELAYS.to_vec(),
            max_total: QOS_MAX_TOTAL,
        }
    }
}

impl QosPolicy {
    /// Delay before the next send after `attempts` sends
    ///
    /// The first send goes out immediately and counts as attempt 1, so
    /// entry 0 is never waited on and the first retry uses entry 1.
    /// The index clamps to the last (longest) entry once the table is
    /// exhausted. An empty table waits the whole budget, which ends the
    /// sequence on the next tick.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let idx = usize::try_from(attempts).unwrap_or(usize::MAX);
        self.retry_delays
            .get(idx)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or(self.max_total)
    }

    /// Check the table is usable
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty table, a zero retry delay, a
    /// decreasing table or a zero budget
    pub fn validate(&self) -> Result<()> {
        if self.retry_delays.is_empty() {
            return Err(Error::Config("QoS retry delay table is empty".to_string()));
        }
        if let Some(idx) = self.retry_delays.iter().skip(1).position(Duration::is_zero) {
            return Err(Error::Config(format!(
                "QoS retry delay {} is zero; only the first entry may be",
                idx + 1
            )));
        }
        if self.retry_delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::Config(
                "QoS retry delays must be non-decreasing".to_string(),
            ));
        }
        if self.max_total.is_zero() {
            return Err(Error::Config("QoS time budget must be positive".to_string()));
        }
        Ok(())
    }
}

/// Decides whether an observed state confirms a desired state
pub type ConfirmFn = Arc<dyn Fn(&Payload, &Payload) -> bool + Send + Sync>;

/// Every field of `desired` is present in `observed` with an equal value
///
/// Fields only present in `observed` are ignored. A desired field missing
/// from `observed` does not confirm. Numbers compare by value so `50`
/// matches `50.0`.
#[must_use]
pub fn fields_match(desired: &Payload, observed: &Payload) -> bool {
    desired.iter().all(|(key, want)| {
        observed
            .get(key)
            .is_some_and(|have| values_equal(want, have))
    })
}

#[allow(clippy::float_cmp)]
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn default_table_values() {
        let policy = QosPolicy::default();
        assert_eq!(policy.retry_delays.len(), 7);
        assert_eq!(policy.retry_delays[0], Duration::ZERO);
        assert_eq!(policy.retry_delays[6], Duration::from_secs(1));
        assert_eq!(policy.max_total, Duration::from_secs(2));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn delay_clamps_to_last_entry() {
        let policy = QosPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(600));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn empty_table_waits_whole_budget() {
        let policy = QosPolicy {
            retry_delays: vec![],
            max_total: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn decreasing_table_is_rejected() {
        let policy = QosPolicy {
            retry_delays: vec![Duration::from_millis(100), Duration::from_millis(50)],
            ..QosPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn zero_retry_delay_is_rejected() {
        let policy = QosPolicy {
            retry_delays: vec![Duration::ZERO, Duration::ZERO],
            max_total: Duration::from_secs(2),
        };
        assert!(matches!(policy.validate(), Err(Error::Config(_))));

        let policy = QosPolicy {
            retry_delays: vec![Duration::ZERO, Duration::from_millis(10)],
            max_total: Duration::from_secs(2),
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn matching_requires_every_desired_field() {
        let desired = payload(json!({"on": true, "speed": 50}));

        assert!(fields_match(&desired, &payload(json!({"on": true, "speed": 50}))));
        assert!(fields_match(
            &desired,
            &payload(json!({"on": true, "speed": 50, "rpm": 1200}))
        ));
        // Absent field does not count as confirmed
        assert!(!fields_match(&desired, &payload(json!({"on": true}))));
        assert!(!fields_match(&desired, &payload(json!({"on": true, "speed": 40}))));
    }

    #[test]
    fn numbers_compare_by_value() {
        let desired = payload(json!({"speed": 50, "level": 0.5}));
        assert!(fields_match(&desired, &payload(json!({"speed": 50.0, "level": 0.5}))));
        assert!(!fields_match(&desired, &payload(json!({"speed": "50", "level": 0.5}))));
    }

    #[test]
    fn empty_desired_is_confirmed_by_anything() {
        assert!(fields_match(&Payload::new(), &payload(json!({"on": false}))));
    }
}
