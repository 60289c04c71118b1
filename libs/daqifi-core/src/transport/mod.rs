//! Transport layer
//!
//! TCP stream transport with retry support, UDP broadcast transport for
//! discovery, and the byte source/sink seams the background workers run over.

pub mod tcp;
pub mod udp;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use tcp::{TcpTransport, TcpTransportConfig};
pub use udp::{UdpTransport, UdpTransportConfig};

/// Connection status of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No connection
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connection established
    Connected,
    /// Connection dropped while in use
    Lost,
}

impl ConnectionStatus {
    /// Check if the status represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionStatus::Connecting => write!(f, "CONNECTING"),
            ConnectionStatus::Connected => write!(f, "CONNECTED"),
            ConnectionStatus::Lost => write!(f, "LOST"),
        }
    }
}

/// Status notification published by a transport
#[derive(Debug, Clone, Default)]
pub struct StatusEvent {
    /// Current status
    pub status: Option<ConnectionStatus>,
    /// Error accompanying the transition, if any
    pub error: Option<String>,
}

impl StatusEvent {
    /// Create a status event without an error
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status: Some(status),
            error: None,
        }
    }

    /// Create a status event carrying an error description
    pub fn with_error(status: ConnectionStatus, error: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(error.into()),
        }
    }
}

/// Readable side of a byte stream
///
/// Implementations return `Ok(0)` on read timeout so polling loops can keep
/// checking their shutdown flag, and fail with `ConnectionError` when the
/// peer closes the stream.
#[async_trait]
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes, waiting at most `timeout`
    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Writable side of a byte stream
#[async_trait]
pub trait ByteSink: Send {
    /// Write the full buffer to the stream
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "CONNECTED");
        assert_eq!(ConnectionStatus::Lost.to_string(), "LOST");
    }

    #[test]
    fn test_is_connected() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Connecting.is_connected());
        assert!(!ConnectionStatus::Lost.is_connected());
    }
}
