//! Datagram transports the hub runs on
//!
//! [`MulticastTransport`] is the real UDP multicast socket. [`MemoryBus`]
//! hands out in-process transports sharing one broadcast medium, used by
//! tests and simulations that must not touch the network.
//!
//! Sending is fire-and-forget: failures are logged and swallowed. The QoS
//! layer above is what turns an unreliable send into a confirmed one.

pub mod memory;
pub mod multicast;

use std::net::SocketAddr;

use async_trait::async_trait;

pub use memory::{MemoryBus, MemoryTransport};
pub use multicast::{MulticastSettings, MulticastTransport};

use crate::Result;

/// One received datagram and where it came from
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Raw bytes
    pub bytes: Vec<u8>,
    /// Sender address
    pub source: SocketAddr,
}

/// A datagram transport with a blocking receive side
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind and join the group; calling it on an open transport is a no-op
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound or the group cannot be joined
    fn open(&self) -> Result<()>;

    /// Write one datagram to the group. Never fails; errors are logged
    fn send(&self, bytes: &[u8]);

    /// Wait for the next datagram
    ///
    /// Returns `Ok(None)` once the transport is closed. An `Err` is a
    /// receive failure the caller may retry after backing off.
    async fn recv(&self) -> std::io::Result<Option<Datagram>>;

    /// Release the socket and wake any pending `recv`; idempotent
    fn close(&self);
}
