//! UDP multicast transport
//!
//! Binds `0.0.0.0:<port>` with address (and, where available, port) reuse
//! so several bus participants can share a host, joins the group on the
//! configured interface and disables multicast loopback so the hub does
//! not hear its own pings and commands.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::{Datagram, Transport};
use crate::protocol::{DEFAULT_GROUP, DEFAULT_PORT, MAX_DATAGRAM};
use crate::{Error, Result};

/// Socket parameters for a multicast transport
#[derive(Debug, Clone)]
pub struct MulticastSettings {
    /// Multicast group address
    pub group: Ipv4Addr,
    /// Group port (also the local bind port)
    pub port: u16,
    /// Interface to join on (`0.0.0.0` lets the OS pick)
    pub interface: Ipv4Addr,
    /// Deliver our own datagrams back to us
    pub multicast_loop: bool,
    /// Receive buffer size per datagram
    pub recv_buffer: usize,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_loop: false,
            recv_buffer: MAX_DATAGRAM,
        }
    }
}

impl MulticastSettings {
    /// Destination address for every send
    #[must_use]
    pub const fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

/// UDP multicast transport
pub struct MulticastTransport {
    settings: MulticastSettings,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    closed: watch::Sender<bool>,
}

impl MulticastTransport {
    /// Create an unopened transport
    #[must_use]
    pub fn new(settings: MulticastSettings) -> Self {
        let (closed, _) = watch::channel(true);
        Self {
            settings,
            socket: RwLock::new(None),
            closed,
        }
    }

    /// Socket parameters
    #[must_use]
    pub const fn settings(&self) -> &MulticastSettings {
        &self.settings
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().ok().and_then(|guard| guard.clone())
    }

    fn bind(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if let Err(e) = socket.set_reuse_port(true) {
            tracing::debug!(error = %e, "SO_REUSEPORT unavailable");
        }

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.settings.port));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&self.settings.group, &self.settings.interface)?;

        // Loopback suppression is best-effort; some stacks refuse the option
        if let Err(e) = socket.set_multicast_loop_v4(self.settings.multicast_loop) {
            tracing::warn!(error = %e, "could not set multicast loopback, continuing");
        }

        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    fn open(&self) -> Result<()> {
        let mut guard = self
            .socket
            .write()
            .map_err(|_| Error::Transport("socket lock poisoned".to_string()))?;
        if guard.is_some() {
            return Ok(());
        }

        let socket = self.bind().map_err(|e| {
            Error::Transport(format!(
                "failed to join {}:{}: {e}",
                self.settings.group, self.settings.port
            ))
        })?;
        *guard = Some(Arc::new(socket));
        self.closed.send_replace(false);

        tracing::info!(
            group = %self.settings.group,
            port = self.settings.port,
            interface = %self.settings.interface,
            "multicast transport open"
        );
        Ok(())
    }

    fn send(&self, bytes: &[u8]) {
        let Some(socket) = self.current_socket() else {
            tracing::debug!(len = bytes.len(), "send on closed transport dropped");
            return;
        };

        if let Err(e) = socket.try_send_to(bytes, self.settings.destination()) {
            tracing::error!(error = %e, len = bytes.len(), "multicast send failed");
        }
    }

    async fn recv(&self) -> std::io::Result<Option<Datagram>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let Some(socket) = self.current_socket() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.settings.recv_buffer];
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Ok(None),
            result = socket.recv_from(&mut buf) => {
                let (len, source) = result?;
                buf.truncate(len);
                Ok(Some(Datagram { bytes: buf, source }))
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
        let taken = self.socket.write().ok().and_then(|mut guard| guard.take());
        if taken.is_some() {
            tracing::info!("multicast transport closed");
        }
    }
}
