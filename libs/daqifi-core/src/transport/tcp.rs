//! TCP stream transport
//!
//! Single-endpoint bidirectional byte stream with retryable connect. The
//! device speaks both text commands and binary records over this one socket;
//! the transport only moves bytes and publishes connection status changes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{DaqifiError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{ByteSink, ByteSource, ConnectionStatus, StatusEvent};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Device host name or IP address
    pub host: String,
    /// Device TCP port
    pub port: u16,
    /// Operational read timeout applied to the stream after connect.
    /// Kept short so consumer loops notice shutdown requests promptly.
    pub read_timeout: Duration,
}

impl TcpTransportConfig {
    /// Create a configuration for the given endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            read_timeout: Duration::from_millis(500),
        }
    }

    /// Validate endpoint parameters
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DaqifiError::ConfigError(
                "TCP host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(DaqifiError::ConfigError(
                "TCP port must be in range 1..=65535".to_string(),
            ));
        }
        Ok(())
    }
}

/// TCP transport for one device endpoint
pub struct TcpTransport {
    config: TcpTransportConfig,
    status_tx: watch::Sender<StatusEvent>,
    halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    disposed: bool,
}

impl TcpTransport {
    /// Create a disconnected transport
    pub fn new(config: TcpTransportConfig) -> Self {
        let (status_tx, _) = watch::channel(StatusEvent::default());
        Self {
            config,
            status_tx,
            halves: None,
            disposed: false,
        }
    }

    /// Subscribe to connection status notifications
    pub fn subscribe_status(&self) -> watch::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Operational read timeout for the connected stream
    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }

    /// Check whether a connection is currently held
    pub fn is_connected(&self) -> bool {
        self.halves.is_some()
    }

    fn publish(&self, event: StatusEvent) {
        // Receivers may be gone; status publishing is best-effort
        let _ = self.status_tx.send(event);
    }

    /// Connect to the configured endpoint under the given retry policy
    ///
    /// Performs 1..N attempts, resolving the host name at each attempt and
    /// bounding every attempt with the policy timeout. Raises `Connecting`
    /// first, an intermediate error status per failed attempt, and either
    /// `Connected` or a final `Disconnected` carrying the last error.
    pub async fn connect(&mut self, policy: &RetryPolicy) -> Result<()> {
        if self.disposed {
            return Err(DaqifiError::Disposed);
        }
        self.config.validate()?;
        policy.validate()?;

        // Drop any previous connection before reconnecting
        self.halves = None;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let attempts = policy.effective_attempts();
        self.publish(StatusEvent::new(ConnectionStatus::Connecting));

        let mut last_error = DaqifiError::ConnectionError(format!("failed to connect to {addr}"));
        for attempt in 1..=attempts {
            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                debug!("Waiting {:?} before connection attempt {}", delay, attempt);
                tokio::time::sleep(delay).await;
            }

            info!(
                "Connecting to {} (attempt {}/{})",
                addr, attempt, attempts
            );
            match timeout(policy.attempt_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    let (read_half, write_half) = stream.into_split();
                    self.halves = Some((read_half, write_half));
                    info!("Connected to {}", addr);
                    self.publish(StatusEvent::new(ConnectionStatus::Connected));
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, addr, e);
                    last_error =
                        DaqifiError::ConnectionError(format!("failed to connect to {addr}: {e}"));
                }
                Err(_) => {
                    warn!("Connection attempt {} to {} timed out", attempt, addr);
                    last_error =
                        DaqifiError::TimeoutError(format!("connection to {addr} timed out"));
                }
            }
            // Intermediate status so observers see each failed attempt
            self.publish(StatusEvent::with_error(
                ConnectionStatus::Connecting,
                last_error.to_string(),
            ));
        }

        self.publish(StatusEvent::with_error(
            ConnectionStatus::Disconnected,
            last_error.to_string(),
        ));
        Err(last_error)
    }

    /// Take the read and write halves of the connected stream
    ///
    /// The halves are handed out exactly once per connection; the consumer
    /// owns the source and the producer owns the sink from then on.
    pub fn take_split(&mut self) -> Result<(Box<dyn ByteSource>, Box<dyn ByteSink>)> {
        if self.disposed {
            return Err(DaqifiError::Disposed);
        }
        let (read_half, write_half) = self.halves.take().ok_or(DaqifiError::NotConnected)?;
        Ok((
            Box::new(TcpByteSource { inner: read_half }),
            Box::new(TcpByteSink { inner: write_half }),
        ))
    }

    /// Close the connection; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        if self.halves.take().is_some() {
            info!("Disconnected from {}:{}", self.config.host, self.config.port);
        }
        self.publish(StatusEvent::new(ConnectionStatus::Disconnected));
    }

    /// Dispose the transport; all later operations fail with `Disposed`
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disconnect().await;
        self.disposed = true;
    }
}

/// Read half of a connected TCP stream
struct TcpByteSource {
    inner: OwnedReadHalf,
}

#[async_trait]
impl ByteSource for TcpByteSource {
    async fn read_chunk(&mut self, buf: &mut [u8], read_timeout: Duration) -> Result<usize> {
        match timeout(read_timeout, self.inner.read(buf)).await {
            Ok(Ok(0)) => Err(DaqifiError::ConnectionLost(
                "connection closed by peer".to_string(),
            )),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(DaqifiError::IoError(format!("TCP receive error: {e}"))),
            // Read timeout is an expected idle condition, not an error
            Err(_) => Ok(0),
        }
    }
}

/// Write half of a connected TCP stream
struct TcpByteSink {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl ByteSink for TcpByteSink {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(data)
            .await
            .map_err(|e| DaqifiError::IoError(format!("TCP send error: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| DaqifiError::IoError(format!("TCP flush error: {e}")))?;
        Ok(())
    }
}
