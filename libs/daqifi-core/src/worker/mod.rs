//! Background workers
//!
//! The session owns one producer draining outbound text commands to the
//! transport write half and one consumer feeding inbound bytes through a
//! framer. Both run as tokio tasks with cooperative shutdown.

pub mod consumer;
pub mod producer;

pub use consumer::{flush_source, Consumer, ConsumerEvent};
pub use producer::Producer;
