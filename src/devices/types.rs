//! Device registry types

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Last-known metadata for one device on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Device identifier
    pub id: String,
    /// Most recent non-empty class the device reported
    pub class: Option<String>,
    /// Display name (`payload.name`, falling back to the identifier)
    pub name: String,
    /// Firmware version, if the device ever reported one
    pub firmware: Option<String>,
    /// Address of the last datagram from this device
    pub last_addr: IpAddr,
    /// When the last datagram from this device arrived
    pub last_seen: DateTime<Utc>,
    /// Liveness as of the last sweep or message
    pub online: bool,
    /// Seconds since boot, from the last pong
    pub uptime: Option<u64>,
    /// Wi-Fi signal strength in dBm, from the last pong
    pub rssi: Option<i64>,
}

/// Outcome of feeding one message to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryUpdate {
    /// Message not admitted
    Ignored(IgnoreReason),
    /// First message from this device
    Created,
    /// Known device refreshed
    Updated {
        /// Device was offline and is online again
        came_online: bool,
    },
}

/// Why a message was not admitted to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not the supported protocol version
    VersionMismatch,
    /// No device identifier
    MissingId,
    /// Sent by the hub itself
    HubOrigin,
}

/// One online/offline flip observed by a liveness sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessTransition {
    /// Device identifier
    pub id: String,
    /// New liveness
    pub online: bool,
    /// Time since the device was last heard from
    pub silent_for: Duration,
}
