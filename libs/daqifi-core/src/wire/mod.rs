//! Device wire protocol
//!
//! The instrument speaks ASCII SCPI-style commands outbound and
//! varint-length-delimited protobuf records inbound. This module holds the
//! record message definition with its status/stream role split and the
//! outbound command builders.

pub mod commands;
pub mod message;

pub use message::{DeviceMessage, MessageRole};
