//! ET-Bus wire protocol
//!
//! Every message on the bus is one UDP datagram holding a compact JSON
//! object:
//!
//! ```text
//! {"v":1,"type":"state","id":"relay-01","class":"switch.relay","payload":{"on":true}}
//! ```
//!
//! - `v`: protocol version, must equal [`PROTOCOL_VERSION`]
//! - `type`: `discover`, `state`, `command`, `ping` or `pong`
//! - `id`: device identifier
//! - `class`: dot-namespaced endpoint kind (`switch.relay`, `sensor.temp`)
//! - `payload`: open, kind-specific object
//!
//! Unknown types and classes decode fine and are passed through; only the
//! version and the overall shape are validated here.

mod envelope;

use std::net::Ipv4Addr;
use std::time::Duration;

pub use envelope::{CodecError, Envelope, MessageType, Payload, decode, encode};

/// The single supported protocol version
pub const PROTOCOL_VERSION: u64 = 1;

/// Default multicast group
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 10, 0, 1);

/// Default multicast port
pub const DEFAULT_PORT: u16 = 5555;

/// Identifier the hub uses for its own messages; never admitted as a device
pub const HUB_ID: &str = "hub";

/// Class the hub uses for its own messages
pub const HUB_CLASS: &str = "hub";

/// Interval between hub pings and liveness sweeps
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A device silent for this long is considered offline
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest datagram the hub will read
pub const MAX_DATAGRAM: usize = 4096;
