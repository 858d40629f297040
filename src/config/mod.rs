//! Configuration management for the ET-Bus hub

pub mod file;

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use self::file::EtbusConfigFile;
use crate::protocol::{HUB_CLASS, HUB_ID, OFFLINE_TIMEOUT, PING_INTERVAL};
use crate::qos::QosPolicy;
use crate::transport::MulticastSettings;
use crate::{Error, Result};

/// Pause after a failed receive before reading again
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// ET-Bus hub configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Multicast socket settings
    pub bus: MulticastSettings,

    /// Hub identity, heartbeat and QoS timing
    pub hub: HubConfig,
}

/// Settings the [`crate::Hub`] itself consumes
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifier on the hub's own messages
    pub id: String,

    /// Class on the hub's own messages
    pub class: String,

    /// Period of pings and liveness sweeps
    pub ping_interval: Duration,

    /// Silence after which a device is marked offline
    pub offline_timeout: Duration,

    /// Pause after a receive error
    pub recv_error_backoff: Duration,

    /// Retry timing handed to every delivery engine
    pub qos: QosPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            id: HUB_ID.to_string(),
            class: HUB_CLASS.to_string(),
            ping_interval: PING_INTERVAL,
            offline_timeout: OFFLINE_TIMEOUT,
            recv_error_backoff: RECV_ERROR_BACKOFF,
            qos: QosPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// With `path` the file must exist and parse. Without it the standard
    /// location is tried and any problem falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file is unusable or the result fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::load_config_file_from(path)?,
            None => file::load_config_file(),
        };
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unparsable addresses or invalid timing
    pub fn from_sources(fc: EtbusConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let group = match env("ETBUS_GROUP").or(fc.bus.group) {
            Some(s) => parse_addr("group", &s)?,
            None => defaults.bus.group,
        };
        let interface = match env("ETBUS_INTERFACE").or(fc.bus.interface) {
            Some(s) => parse_addr("interface", &s)?,
            None => defaults.bus.interface,
        };
        let port = match env("ETBUS_PORT") {
            Some(s) => s
                .parse()
                .map_err(|_| Error::Config(format!("invalid ETBUS_PORT: {s}")))?,
            None => fc.bus.port.unwrap_or(defaults.bus.port),
        };

        let bus = MulticastSettings {
            group,
            port,
            interface,
            multicast_loop: fc.bus.multicast_loop.unwrap_or(defaults.bus.multicast_loop),
            recv_buffer: fc.bus.recv_buffer.unwrap_or(defaults.bus.recv_buffer),
        };

        let ping_interval = match env("ETBUS_PING_INTERVAL") {
            Some(s) => parse_secs("ETBUS_PING_INTERVAL", &s)?,
            None => fc
                .hub
                .ping_interval_secs
                .map_or(defaults.hub.ping_interval, Duration::from_secs),
        };
        let offline_timeout = match env("ETBUS_OFFLINE_TIMEOUT") {
            Some(s) => parse_secs("ETBUS_OFFLINE_TIMEOUT", &s)?,
            None => fc
                .hub
                .offline_timeout_secs
                .map_or(defaults.hub.offline_timeout, Duration::from_secs),
        };

        let qos = QosPolicy {
            retry_delays: fc.qos.retry_delays_ms.map_or(defaults.hub.qos.retry_delays, |ms| {
                ms.into_iter().map(Duration::from_millis).collect()
            }),
            max_total: fc
                .qos
                .max_total_ms
                .map_or(defaults.hub.qos.max_total, Duration::from_millis),
        };

        let hub = HubConfig {
            id: fc.hub.id.unwrap_or(defaults.hub.id),
            class: fc.hub.class.unwrap_or(defaults.hub.class),
            ping_interval,
            offline_timeout,
            recv_error_backoff: fc
                .hub
                .recv_error_backoff_ms
                .map_or(defaults.hub.recv_error_backoff, Duration::from_millis),
            qos,
        };

        let config = Self { bus, hub };
        config.validate()?;
        Ok(config)
    }

    /// Check the merged configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if !self.bus.group.is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a multicast address",
                self.bus.group
            )));
        }
        if self.bus.recv_buffer == 0 {
            return Err(Error::Config("receive buffer must be non-zero".to_string()));
        }
        if self.hub.ping_interval.is_zero() {
            return Err(Error::Config("ping interval must be non-zero".to_string()));
        }
        if self.hub.offline_timeout.is_zero() {
            return Err(Error::Config("offline timeout must be non-zero".to_string()));
        }
        if self.hub.id.is_empty() {
            return Err(Error::Config("hub id must not be empty".to_string()));
        }
        self.hub.qos.validate()
    }
}

fn parse_addr(what: &str, s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid {what} address: {s}")))
}

fn parse_secs(var: &str, s: &str) -> Result<Duration> {
    s.trim()
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| Error::Config(format!("invalid {var}: {s} (expected whole seconds)")))
}
