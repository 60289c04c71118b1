//! Composite text/record framer
//!
//! The device interleaves text replies and binary records on one socket, so
//! a chunk must be classified before it can be framed. Classification is
//! heuristic; the priority order below matches observed device behavior and
//! must be preserved when tuning the thresholds.

use tracing::trace;

use crate::framing::{FramedBatch, LineFramer, MessageFramer, ParsedMessage, RecordFramer};

/// Printable-ASCII ratio above which a chunk is treated as text
const PRINTABLE_RATIO_TEXT: f64 = 0.80;

/// NUL-byte ratio above which a chunk is treated as records
const NUL_RATIO_RECORD: f64 = 0.10;

/// NUL-byte ratio that, combined with a plausible field header, indicates records
const NUL_RATIO_RECORD_WEAK: f64 = 0.05;

/// Command prefixes the device echoes or replies with in text mode
const TEXT_PREFIXES: [&str; 3] = ["SYST", "ENA", "*"];

/// Classification of a byte chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// CRLF-terminated text
    Text,
    /// Length-delimited records
    Record,
    /// Ambiguous; try text first, then records
    Uncertain,
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7E).contains(&byte) || byte == b'\r' || byte == b'\n' || byte == b'\t'
}

/// Check the first five bytes for a pair that could open a binary field:
/// a low wire-type nibble with a nonzero field number
fn has_field_header_pair(buf: &[u8]) -> bool {
    let head = &buf[..buf.len().min(5)];
    head.windows(2)
        .any(|pair| (pair[0] & 7) <= 5 && (pair[0] >> 3) > 0)
}

/// Classify one chunk of bytes
pub fn classify_chunk(buf: &[u8]) -> FrameKind {
    if buf.is_empty() {
        return FrameKind::Uncertain;
    }

    let len = buf.len() as f64;
    let printable = buf.iter().filter(|&&b| is_printable(b)).count() as f64 / len;
    if printable > PRINTABLE_RATIO_TEXT {
        return FrameKind::Text;
    }

    let starts_with_command = TEXT_PREFIXES
        .iter()
        .any(|prefix| buf.starts_with(prefix.as_bytes()));
    if starts_with_command || buf.ends_with(b"\r\n") || buf.ends_with(b"\n") {
        return FrameKind::Text;
    }

    let nul_ratio = buf.iter().filter(|&&b| b == 0).count() as f64 / len;
    if nul_ratio > NUL_RATIO_RECORD {
        return FrameKind::Record;
    }
    if nul_ratio > NUL_RATIO_RECORD_WEAK && has_field_header_pair(buf) {
        return FrameKind::Record;
    }

    FrameKind::Uncertain
}

/// Framer that dispatches each chunk to the line or record framer
///
/// Stateless across calls: buffering partial frames between calls is the
/// consumer's responsibility.
#[derive(Debug, Default)]
pub struct CompositeFramer {
    line: LineFramer,
    record: RecordFramer,
}

impl CompositeFramer {
    /// Create a composite framer with default line and record framers
    pub fn new() -> Self {
        Self {
            line: LineFramer::new(),
            record: RecordFramer::new(),
        }
    }
}

impl MessageFramer for CompositeFramer {
    fn parse_messages(&mut self, buf: &[u8]) -> FramedBatch {
        let kind = classify_chunk(buf);
        trace!("Classified {} byte chunk as {:?}", buf.len(), kind);

        match kind {
            FrameKind::Text => self.line.parse_messages(buf),
            FrameKind::Record => self.record.parse_messages(buf),
            FrameKind::Uncertain => {
                let text = self.line.parse_messages(buf);
                if text.bytes_consumed > 0 {
                    text
                } else {
                    self.record.parse_messages(buf)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DeviceMessage;
    use prost::Message as _;

    #[test]
    fn test_mostly_printable_classifies_text() {
        assert_eq!(classify_chunk(b"READY\r\nVERSION 1.0\r\n"), FrameKind::Text);
    }

    #[test]
    fn test_command_prefix_classifies_text() {
        // Below the printable threshold would not apply here, but the prefix
        // rule fires before NUL inspection either way
        assert_eq!(classify_chunk(b"SYSTem:ECHO -1\r\n"), FrameKind::Text);
        assert_eq!(classify_chunk(b"**ERROR: -113\r\n"), FrameKind::Text);
    }

    #[test]
    fn test_nul_heavy_classifies_record() {
        let buf = [0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFE, 0xFD];
        assert_eq!(classify_chunk(&buf), FrameKind::Record);
    }

    #[test]
    fn test_weak_nul_with_field_header_classifies_record() {
        // One NUL in 16 bytes (6.25%) plus an opening field-header pair
        let mut buf = vec![0x0A, 0x04];
        buf.extend([0xC8, 0xD1, 0x00, 0xBB, 0x91, 0xA3, 0xB0, 0xC4, 0xD5, 0xE6, 0xF7, 0x88, 0x99, 0xAA]);
        assert_eq!(classify_chunk(&buf), FrameKind::Record);
    }

    #[test]
    fn test_record_chunk_parses_through_composite() {
        let record = DeviceMessage {
            msg_time_stamp: Some(42),
            analog_in_data: vec![0, 0, 0, 0],
            ..Default::default()
        };
        let buf = record.encode_length_delimited_to_vec();

        let mut framer = CompositeFramer::new();
        let batch = framer.parse_messages(&buf);
        assert_eq!(batch.bytes_consumed, buf.len());
        assert_eq!(batch.messages, vec![ParsedMessage::Record(Box::new(record))]);
    }

    #[test]
    fn test_text_chunk_parses_through_composite() {
        let mut framer = CompositeFramer::new();
        let batch = framer.parse_messages(b"SYSTem:ECHO -1\r\n");
        assert_eq!(batch.messages, vec![ParsedMessage::Line("SYSTem:ECHO -1".to_string())]);
    }

    #[test]
    fn test_uncertain_falls_back_to_records() {
        // Binary-looking chunk without NULs or terminators
        let record = DeviceMessage {
            analog_in_data_float: vec![-1.5e-9, 2.25e7],
            ..Default::default()
        };
        let buf = record.encode_length_delimited_to_vec();
        let kind = classify_chunk(&buf);
        let mut framer = CompositeFramer::new();
        let batch = framer.parse_messages(&buf);
        // Whatever the classification, the record must come out whole
        assert_eq!(batch.messages.len(), 1, "kind was {kind:?}");
    }
}
