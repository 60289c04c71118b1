//! # DAQiFi client library
//!
//! Discovers, connects to, and streams data from DAQiFi data-acquisition
//! instruments. One device speaks three wire protocols: a UDP broadcast
//! discovery probe, an ASCII command channel over TCP, and a
//! varint-length-delimited binary record stream on the same TCP socket.
//!
//! ## Typical flow
//!
//! ```text
//! DiscoveryService::discover  ──►  DeviceDescriptor
//!                                        │
//!                                        ▼
//! DeviceSession::for_descriptor → connect → initialize
//!                                        │
//!            set_channels_enabled + start_streaming
//!                                        │
//!                                        ▼
//!        SessionEvent::RecordReceived / channel samples
//! ```
//!
//! Transports, framers, and workers are public so callers with unusual
//! needs can compose them directly; most use the session layer.

pub mod device;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod retry;
pub mod timestamp;
pub mod transport;
pub mod wire;
pub mod worker;

pub use device::{
    Channel, ChannelDirection, ChannelSnapshot, DeviceKind, DeviceMetadata, DeviceSession,
    Sample, SampleValue, SessionConfig, SessionEvent, SessionState,
};
pub use discovery::{DeviceDescriptor, DiscoveryConfig, DiscoveryEvent, DiscoveryService};
pub use error::{DaqifiError, Result};
pub use retry::RetryPolicy;
pub use timestamp::{TickObservation, TimestampProcessor};
pub use transport::{
    ConnectionStatus, TcpTransport, TcpTransportConfig, UdpTransport, UdpTransportConfig,
};
pub use wire::{DeviceMessage, MessageRole};
