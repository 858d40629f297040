//! In-process broadcast medium
//!
//! Every [`MemoryTransport`] created from the same [`MemoryBus`] sees the
//! datagrams sent by the others, like hosts on one multicast group.
//! Senders do not receive their own datagrams unless loopback is enabled.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, watch};

use super::{Datagram, Transport};
use crate::protocol::DEFAULT_PORT;
use crate::{Error, Result};

/// Datagrams buffered per receiver before it lags
const BUS_CAPACITY: usize = 1024;

/// Shared in-memory medium
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Datagram>,
    next_host: Arc<AtomicU8>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create an empty medium
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            next_host: Arc::new(AtomicU8::new(1)),
        }
    }

    /// New transport with the next free `10.0.0.x` address
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), DEFAULT_PORT);
        self.transport_at(addr)
    }

    /// New transport with a fixed address
    #[must_use]
    pub fn transport_at(&self, addr: SocketAddr) -> MemoryTransport {
        let (closed, _) = watch::channel(true);
        MemoryTransport {
            addr,
            bus: self.tx.clone(),
            rx: Mutex::new(None),
            closed,
            open: AtomicBool::new(false),
            loopback: false,
        }
    }

    /// Put raw bytes on the medium as if `source` had sent them
    pub fn inject(&self, bytes: impl Into<Vec<u8>>, source: SocketAddr) {
        let _ = self.tx.send(Datagram {
            bytes: bytes.into(),
            source,
        });
    }

    /// Observe every datagram sent from now on
    #[must_use]
    pub fn tap(&self) -> broadcast::Receiver<Datagram> {
        self.tx.subscribe()
    }
}

/// One participant on a [`MemoryBus`]
pub struct MemoryTransport {
    addr: SocketAddr,
    bus: broadcast::Sender<Datagram>,
    rx: Mutex<Option<broadcast::Receiver<Datagram>>>,
    closed: watch::Sender<bool>,
    open: AtomicBool,
    loopback: bool,
}

impl MemoryTransport {
    /// Address this participant sends from
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Also receive our own datagrams
    #[must_use]
    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| Error::Transport("memory transport busy".to_string()))?;
        *rx = Some(self.bus.subscribe());
        self.open.store(true, Ordering::Release);
        self.closed.send_replace(false);
        Ok(())
    }

    fn send(&self, bytes: &[u8]) {
        if !self.open.load(Ordering::Acquire) {
            tracing::debug!(len = bytes.len(), "send on closed transport dropped");
            return;
        }
        // No receivers is not an error on a broadcast medium
        let _ = self.bus.send(Datagram {
            bytes: bytes.to_vec(),
            source: self.addr,
        });
    }

    async fn recv(&self) -> std::io::Result<Option<Datagram>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut guard = self.rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => return Ok(None),
                received = rx.recv() => match received {
                    Ok(datagram) if datagram.source == self.addr && !self.loopback => {}
                    Ok(datagram) => return Ok(Some(datagram)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Err(std::io::Error::other(format!(
                            "receiver lagged, {skipped} datagrams lost"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
            }
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_hear_each_other_but_not_themselves() {
        let bus = MemoryBus::new();
        let a = bus.transport();
        let b = bus.transport();
        a.open().unwrap();
        b.open().unwrap();

        a.send(b"hello");
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.bytes, b"hello");
        assert_eq!(got.source, a.local_addr());

        b.send(b"back");
        let got = a.recv().await.unwrap().unwrap();
        assert_eq!(got.bytes, b"back");
    }

    #[tokio::test]
    async fn close_wakes_pending_recv() {
        let bus = MemoryBus::new();
        let t = Arc::new(bus.transport());
        t.open().unwrap();

        let waiter = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.recv().await })
        };
        tokio::task::yield_now().await;
        t.close();

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_none());
        t.close();
    }

    #[tokio::test]
    async fn unopened_transport_drops_sends() {
        let bus = MemoryBus::new();
        let mut tap = bus.tap();
        let t = bus.transport();
        t.send(b"nope");
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn injected_bytes_reach_receivers() {
        let bus = MemoryBus::new();
        let t = bus.transport();
        t.open().unwrap();

        let from: SocketAddr = "192.168.1.50:5555".parse().unwrap();
        bus.inject(b"raw".to_vec(), from);

        let got = t.recv().await.unwrap().unwrap();
        assert_eq!(got.source, from);
    }
}
