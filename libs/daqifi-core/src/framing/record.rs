//! Binary record framer
//!
//! Extracts `[varint length][payload]` frames from a byte buffer. The device
//! occasionally emits garbage between frames (power events, line noise on
//! reconnect), so the framer recovers by skipping single bytes and gives up
//! on a pass after a bounded number of consecutive recovery steps.

use prost::Message;
use tracing::{debug, trace};

use crate::framing::{FramedBatch, MessageFramer, ParsedMessage};
use crate::wire::DeviceMessage;

/// Consecutive recovery steps allowed before aborting the current pass
const MAX_RECOVERY_STEPS: u32 = 3;

/// Longest varint prefix the protocol produces (32-bit length)
const MAX_VARINT_BYTES: usize = 5;

/// Upper bound on a sane record length
const MAX_RECORD_LEN: u64 = 1024 * 1024;

/// Outcome of reading one varint length prefix
enum VarintRead {
    /// Decoded value and the number of prefix bytes
    Value { value: u64, len: usize },
    /// Buffer ends before the varint does
    Insufficient,
    /// Five bytes with the continuation bit still set
    Malformed,
}

fn read_varint(buf: &[u8]) -> VarintRead {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_BYTES).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return VarintRead::Value { value, len: i + 1 };
        }
    }
    if buf.len() < MAX_VARINT_BYTES {
        VarintRead::Insufficient
    } else {
        VarintRead::Malformed
    }
}

/// How framed payloads are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadDecode {
    /// Decode as a protobuf device record
    Protobuf,
    /// Pass payload bytes through untouched
    Opaque,
}

/// Framer for varint-length-prefixed records
#[derive(Debug)]
pub struct RecordFramer {
    decode: PayloadDecode,
    total_retries: u64,
}

impl Default for RecordFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordFramer {
    /// Create a framer that decodes payloads as device records
    pub fn new() -> Self {
        Self {
            decode: PayloadDecode::Protobuf,
            total_retries: 0,
        }
    }

    /// Create a framer that emits raw payload bytes without decoding
    pub fn opaque() -> Self {
        Self {
            decode: PayloadDecode::Opaque,
            total_retries: 0,
        }
    }

    /// Total recovery steps taken over the framer's lifetime
    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }

    fn decode_payload(&self, payload: &[u8]) -> Option<ParsedMessage> {
        match self.decode {
            PayloadDecode::Protobuf => DeviceMessage::decode(payload)
                .map(|msg| ParsedMessage::Record(Box::new(msg)))
                .ok(),
            PayloadDecode::Opaque => Some(ParsedMessage::Payload(payload.to_vec())),
        }
    }
}

impl MessageFramer for RecordFramer {
    fn parse_messages(&mut self, buf: &[u8]) -> FramedBatch {
        let mut batch = FramedBatch::default();
        let mut pos = 0;
        let mut consecutive_recoveries = 0;

        while pos < buf.len() {
            if consecutive_recoveries >= MAX_RECOVERY_STEPS {
                debug!(
                    "Aborting framing pass after {} consecutive recovery steps",
                    consecutive_recoveries
                );
                break;
            }

            let rest = &buf[pos..];
            let (value, prefix_len) = match read_varint(rest) {
                VarintRead::Value { value, len } => (value, len),
                VarintRead::Insufficient => break,
                VarintRead::Malformed => {
                    trace!("Malformed length prefix at offset {}", pos);
                    pos += 1;
                    consecutive_recoveries += 1;
                    self.total_retries += 1;
                    batch.parse_failures += 1;
                    continue;
                }
            };

            // A zero or absurd length is garbage; skip one byte and retry
            if value == 0 || value > MAX_RECORD_LEN {
                trace!("Implausible record length {} at offset {}", value, pos);
                pos += 1;
                consecutive_recoveries += 1;
                self.total_retries += 1;
                batch.parse_failures += 1;
                continue;
            }

            let payload_len = value as usize;
            if rest.len() < prefix_len + payload_len {
                // Partial frame: leave everything from the prefix onward
                break;
            }

            let payload = &rest[prefix_len..prefix_len + payload_len];
            match self.decode_payload(payload) {
                Some(message) => {
                    batch.messages.push(message);
                    pos += prefix_len + payload_len;
                    consecutive_recoveries = 0;
                }
                None => {
                    trace!("Record decode failed at offset {}", pos);
                    pos += 1;
                    consecutive_recoveries += 1;
                    self.total_retries += 1;
                    batch.parse_failures += 1;
                }
            }
        }

        batch.bytes_consumed = pos;
        batch
    }
}
