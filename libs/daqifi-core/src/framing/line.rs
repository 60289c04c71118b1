//! Text line framer
//!
//! Extracts terminator-delimited text lines from a byte buffer. Used while
//! the device echoes or replies in text mode.

use crate::framing::{FramedBatch, MessageFramer, ParsedMessage};

/// Framer for terminator-delimited ASCII/UTF-8 lines
#[derive(Debug, Clone)]
pub struct LineFramer {
    terminator: Vec<u8>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create a framer using the CRLF terminator
    pub fn new() -> Self {
        Self {
            terminator: b"\r\n".to_vec(),
        }
    }

    /// Create a framer with a custom terminator
    pub fn with_terminator(terminator: &[u8]) -> Self {
        let terminator = if terminator.is_empty() {
            b"\r\n".to_vec()
        } else {
            terminator.to_vec()
        };
        Self { terminator }
    }

    fn find_terminator(&self, buf: &[u8], from: usize) -> Option<usize> {
        let term = self.terminator.as_slice();
        if buf.len() < from + term.len() {
            return None;
        }
        (from..=buf.len() - term.len()).find(|&i| &buf[i..i + term.len()] == term)
    }
}

impl MessageFramer for LineFramer {
    fn parse_messages(&mut self, buf: &[u8]) -> FramedBatch {
        let mut batch = FramedBatch::default();
        let mut pos = 0;

        while let Some(term_at) = self.find_terminator(buf, pos) {
            let line = String::from_utf8_lossy(&buf[pos..term_at]);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                batch.messages.push(ParsedMessage::Line(trimmed.to_string()));
            }
            pos = term_at + self.terminator.len();
        }

        // Consumed up to the end of the last terminator; a trailing partial
        // line waits for more bytes
        batch.bytes_consumed = pos;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_lines_and_consumes_terminators() {
        let mut framer = LineFramer::new();
        let batch = framer.parse_messages(b"READY\r\nOK\r\n");
        assert_eq!(
            batch.messages,
            vec![
                ParsedMessage::Line("READY".to_string()),
                ParsedMessage::Line("OK".to_string()),
            ]
        );
        assert_eq!(batch.bytes_consumed, 11);
        assert_eq!(batch.parse_failures, 0);
    }

    #[test]
    fn test_partial_line_left_in_buffer() {
        let mut framer = LineFramer::new();
        let batch = framer.parse_messages(b"OK\r\npartial");
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.bytes_consumed, 4);
    }

    #[test]
    fn test_no_terminator_consumes_nothing() {
        let mut framer = LineFramer::new();
        let batch = framer.parse_messages(b"no terminator here");
        assert!(batch.messages.is_empty());
        assert_eq!(batch.bytes_consumed, 0);
    }

    #[test]
    fn test_blank_and_whitespace_lines_dropped() {
        let mut framer = LineFramer::new();
        let batch = framer.parse_messages(b"\r\n   \r\nvalue\r\n");
        assert_eq!(batch.messages, vec![ParsedMessage::Line("value".to_string())]);
        // Terminators of dropped lines are still consumed
        assert_eq!(batch.bytes_consumed, 14);
    }

    #[test]
    fn test_lines_are_trimmed() {
        let mut framer = LineFramer::new();
        let batch = framer.parse_messages(b"  spaced  \r\n");
        assert_eq!(batch.messages, vec![ParsedMessage::Line("spaced".to_string())]);
    }

    #[test]
    fn test_custom_terminator() {
        let mut framer = LineFramer::with_terminator(b"\n");
        let batch = framer.parse_messages(b"a\nb\n");
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.bytes_consumed, 4);
    }
}
