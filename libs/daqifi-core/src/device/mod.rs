//! Device session layer
//!
//! Everything above the raw transports: the session orchestrating workers
//! and the handshake, the channel model, and device metadata.

pub mod channel;
pub mod metadata;
pub mod session;

pub use channel::{
    AnalogCalibration, AnalogChannel, Channel, ChannelDirection, ChannelKind, ChannelSnapshot,
    DigitalChannel, Sample, SampleValue,
};
pub use metadata::{DeviceKind, DeviceMetadata};
pub use session::{DeviceSession, SessionConfig, SessionEvent, SessionState};
