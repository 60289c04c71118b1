//! Error handling for the DAQiFi client library
//!
//! Provides the crate-wide error enumeration and `Result` alias. Error
//! variants are protocol-oriented rather than transport-specific so callers
//! can match on the failure kind without knowing which socket produced it.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, DaqifiError>;

/// Error type covering all client library operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaqifiError {
    /// Invalid configuration (empty host, port out of range, bad retry policy)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/output failure on a socket or stream
    #[error("IO error: {0}")]
    IoError(String),

    /// Connection establishment failed after all retry attempts
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection dropped while a session was active
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// Producer operation while the worker is stopped
    #[error("Producer is not running")]
    NotRunning,

    /// Operation on a disposed component
    #[error("Component has been disposed")]
    Disposed,

    /// Deadline exceeded
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Framing or record decode failure
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Device returned an error reply or violated the protocol
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Outbound message was empty or whitespace-only
    #[error("Outbound message is empty")]
    EmptyMessage,

    /// Outbound payload type has no configured path to the device
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl DaqifiError {
    /// Check whether the error indicates a lost or unusable connection
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DaqifiError::ConnectionError(_)
                | DaqifiError::ConnectionLost(_)
                | DaqifiError::NotConnected
        )
    }

    /// Check whether the error is worth retrying at the transport level
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaqifiError::IoError(_)
                | DaqifiError::ConnectionError(_)
                | DaqifiError::TimeoutError(_)
        )
    }
}

impl From<std::io::Error> for DaqifiError {
    fn from(e: std::io::Error) -> Self {
        DaqifiError::IoError(e.to_string())
    }
}

impl From<prost::DecodeError> for DaqifiError {
    fn from(e: prost::DecodeError) -> Self {
        DaqifiError::ParseError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        assert!(DaqifiError::NotConnected.is_connection_error());
        assert!(DaqifiError::ConnectionLost("reset".into()).is_connection_error());
        assert!(!DaqifiError::EmptyMessage.is_connection_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let err: DaqifiError = io.into();
        assert!(matches!(err, DaqifiError::IoError(_)));
        assert!(err.is_retryable());
    }
}
