//! ET-Bus hub - multicast device bus with confirmed command delivery
//!
//! Devices on the local network announce themselves, report state and take
//! commands over one UDP multicast group. This library provides:
//! - The wire codec and multicast transport
//! - A hub that tracks device liveness and fans messages out to subscribers
//! - A per-endpoint QoS engine that retries commands until confirmed
//! - Device-kind adapters and a device-side node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Device kinds (switch, fan, light, sensor)   │
//! │        Catalog  │  DeliveryEngine per endpoint       │
//! └───────────┬──────────────────────────▲──────────────┘
//!     publish │                          │ subscribe
//! ┌───────────▼──────────────────────────┴──────────────┐
//! │                        Hub                           │
//! │   receive loop  │  registry  │  heartbeat           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Transport (UDP multicast / in-memory)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod devices;
pub mod error;
pub mod hub;
pub mod kinds;
pub mod node;
pub mod protocol;
pub mod qos;
pub mod transport;

pub use config::{Config, HubConfig};
pub use daemon::Daemon;
pub use devices::{DeviceRecord, DeviceRegistry, LivenessTransition};
pub use error::{Error, Result};
pub use hub::{Hub, InboundMessage, ShutdownSignal, ShutdownTrigger};
pub use kinds::{Catalog, CatalogChange, Endpoint};
pub use node::{DeviceNode, NodeIdentity};
pub use protocol::{CodecError, Envelope, MessageType, Payload};
pub use qos::{DeliveryEngine, DeliveryEvent, DeliveryState, QosPolicy};
pub use transport::{MemoryBus, MulticastTransport, Transport};
