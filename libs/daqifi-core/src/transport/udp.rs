//! UDP broadcast transport
//!
//! Datagram socket used by the discovery probe: broadcast-capable send plus
//! a timed, cancellable receive that never fails the caller.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DaqifiError, Result};
use crate::transport::{ConnectionStatus, StatusEvent};

/// Largest datagram the discovery protocol is expected to produce
const MAX_DATAGRAM_SIZE: usize = 2048;

/// UDP transport configuration
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Local bind port; 0 selects an ephemeral port
    pub local_port: u16,
}

impl UdpTransportConfig {
    /// Create a configuration binding the given local port
    pub fn new(local_port: u16) -> Self {
        Self { local_port }
    }
}

/// UDP transport with broadcast send and timed receive
pub struct UdpTransport {
    config: UdpTransportConfig,
    socket: Option<UdpSocket>,
    status_tx: watch::Sender<StatusEvent>,
    disposed: bool,
}

impl UdpTransport {
    /// Create a closed transport
    pub fn new(config: UdpTransportConfig) -> Self {
        let (status_tx, _) = watch::channel(StatusEvent::default());
        Self {
            config,
            socket: None,
            status_tx,
            disposed: false,
        }
    }

    /// Subscribe to open/close status notifications
    pub fn subscribe_status(&self) -> watch::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Check whether the socket is open
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Local port the socket is bound to
    pub fn local_port(&self) -> Result<u16> {
        let socket = self.socket.as_ref().ok_or(DaqifiError::NotConnected)?;
        let addr = socket
            .local_addr()
            .map_err(|e| DaqifiError::IoError(e.to_string()))?;
        Ok(addr.port())
    }

    /// Open and bind the socket; a second call is a no-op
    pub fn open(&mut self) -> Result<()> {
        if self.disposed {
            return Err(DaqifiError::Disposed);
        }
        if self.socket.is_some() {
            debug!("UDP transport already open");
            return Ok(());
        }

        match self.bind_socket() {
            Ok(socket) => {
                info!("UDP transport bound to port {}", self.config.local_port);
                self.socket = Some(socket);
                let _ = self.status_tx.send(StatusEvent::new(ConnectionStatus::Connected));
                Ok(())
            }
            Err(e) => {
                let _ = self.status_tx.send(StatusEvent::with_error(
                    ConnectionStatus::Disconnected,
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    fn bind_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| DaqifiError::IoError(format!("failed to create UDP socket: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| DaqifiError::IoError(format!("failed to set SO_REUSEADDR: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DaqifiError::IoError(format!("failed to enable broadcast: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DaqifiError::IoError(e.to_string()))?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.local_port));
        socket
            .bind(&bind_addr.into())
            .map_err(|e| DaqifiError::IoError(format!("failed to bind UDP port {}: {e}", self.config.local_port)))?;

        UdpSocket::from_std(socket.into())
            .map_err(|e| DaqifiError::IoError(format!("failed to register UDP socket: {e}")))
    }

    /// Send a datagram to the limited broadcast address on the given port
    pub async fn send_broadcast(&self, data: &[u8], port: u16) -> Result<()> {
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, port));
        self.send_unicast(data, target).await
    }

    /// Send a datagram to a specific endpoint
    ///
    /// Directed interface broadcasts (e.g. `192.168.1.255`) go through here
    /// as well; the socket already has broadcast permission.
    pub async fn send_unicast(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(DaqifiError::NotConnected)?;
        socket
            .send_to(data, target)
            .await
            .map_err(|e| DaqifiError::IoError(format!("UDP send to {target} failed: {e}")))?;
        debug!("Sent {} bytes to {}", data.len(), target);
        Ok(())
    }

    /// Receive one datagram, waiting at most `wait` and honoring cancellation
    ///
    /// Returns `None` on timeout, cancellation, closed socket, or receive
    /// error; receive problems are logged, never surfaced.
    pub async fn receive(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Option<(Vec<u8>, SocketAddr)> {
        let socket = self.socket.as_ref()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = timeout(wait, socket.recv_from(&mut buf)) => match result {
                Ok(Ok((len, remote))) => {
                    buf.truncate(len);
                    debug!("Received {} bytes from {}", len, remote);
                    Some((buf, remote))
                }
                Ok(Err(e)) => {
                    warn!("UDP receive error: {}", e);
                    None
                }
                Err(_) => None,
            },
        }
    }

    /// Close the socket; safe to call without a prior open
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            info!("UDP transport closed");
        }
        let _ = self
            .status_tx
            .send(StatusEvent::new(ConnectionStatus::Disconnected));
    }

    /// Dispose the transport; later opens fail with `Disposed`
    pub fn dispose(&mut self) {
        self.close();
        self.disposed = true;
    }
}
