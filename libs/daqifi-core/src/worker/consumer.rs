//! Inbound byte consumer
//!
//! Single background task reading from a byte source, feeding a framer, and
//! broadcasting parsed messages. Parse errors never stop the loop; IO errors
//! back off briefly and retry. A safe stop hands the byte source back to the
//! caller so the session can swap framer modes on the same stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::DaqifiError;
use crate::framing::{MessageFramer, ParsedMessage};
use crate::transport::ByteSource;

/// Read chunk size for the consumer loop
const READ_CHUNK_SIZE: usize = 4096;

/// Backoff applied after an IO error before the next read attempt
const IO_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Event emitted by the consumer
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// A framed message in stream order
    Message(ParsedMessage),
    /// A read or parse problem; the loop continues
    Error(DaqifiError),
}

/// Background worker framing inbound bytes into messages
pub struct Consumer {
    events: broadcast::Sender<ConsumerEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Box<dyn ByteSource>>>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl Consumer {
    /// Create a stopped consumer using the given transport read timeout
    pub fn new(read_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self::with_events(read_timeout, events)
    }

    /// Create a stopped consumer publishing into an existing event channel
    ///
    /// Lets a session keep one subscription across framer-mode swaps, where
    /// consumers are stopped and recreated over the same byte source.
    pub fn with_events(read_timeout: Duration, events: broadcast::Sender<ConsumerEvent>) -> Self {
        Self {
            events,
            cancel: CancellationToken::new(),
            handle: None,
            running: Arc::new(AtomicBool::new(false)),
            read_timeout,
        }
    }

    /// Subscribe to message and error events
    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    /// Check whether the read loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the read loop over the given source and framer
    pub fn start(&mut self, mut source: Box<dyn ByteSource>, mut framer: Box<dyn MessageFramer>) {
        if self.is_running() {
            debug!("Consumer already running; start ignored");
            return;
        }

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let read_timeout = self.read_timeout;
        running.store(true, Ordering::Release);

        let handle = tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE * 2);
            let mut chunk = [0u8; READ_CHUNK_SIZE];

            while !cancel.is_cancelled() {
                match source.read_chunk(&mut chunk, read_timeout).await {
                    // Timeout: nothing arrived, check shutdown and poll again
                    Ok(0) => continue,
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        trace!("RX {} bytes ({} buffered)", n, buffer.len());

                        let batch = framer.parse_messages(&buffer);
                        debug_assert!(batch.bytes_consumed <= buffer.len());
                        for message in batch.messages {
                            let _ = events.send(ConsumerEvent::Message(message));
                        }
                        if batch.parse_failures > 0 {
                            // One error per chunk no matter how many bytes
                            // had to be skipped
                            let _ = events.send(ConsumerEvent::Error(DaqifiError::ParseError(
                                format!(
                                    "skipped {} unparseable byte(s) in stream",
                                    batch.parse_failures
                                ),
                            )));
                        }
                        if batch.bytes_consumed > 0 {
                            buffer.advance(batch.bytes_consumed);
                        }
                    }
                    Err(e) => {
                        warn!("Consumer read error: {}", e);
                        let _ = events.send(ConsumerEvent::Error(e));
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(IO_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }

            running.store(false, Ordering::Release);
            debug!("Consumer loop exiting ({} bytes left unparsed)", buffer.len());
            source
        });

        self.handle = Some(handle);
    }

    /// Stop immediately; the byte source is lost with the aborted task
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Stop cooperatively, returning the byte source for reuse
    ///
    /// Relies on the short transport read timeout for promptness. Returns
    /// `None` if the loop failed to exit within `stop_timeout`.
    pub async fn stop_safely(&mut self, stop_timeout: Duration) -> Option<Box<dyn ByteSource>> {
        self.cancel.cancel();
        let handle = self.handle.take()?;
        match timeout(stop_timeout, handle).await {
            Ok(Ok(source)) => {
                self.running.store(false, Ordering::Release);
                Some(source)
            }
            Ok(Err(e)) => {
                warn!("Consumer task ended abnormally: {}", e);
                self.running.store(false, Ordering::Release);
                None
            }
            Err(_) => {
                warn!("Consumer did not stop within {:?}", stop_timeout);
                self.running.store(false, Ordering::Release);
                None
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain bytes already queued on a source, discarding them
///
/// Used at session start to throw away stale stream data the device sent
/// before the handshake.
pub async fn flush_source(source: &mut Box<dyn ByteSource>, window: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + window;
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut flushed = 0;

    while tokio::time::Instant::now() < deadline {
        match source.read_chunk(&mut chunk, Duration::from_millis(20)).await {
            Ok(0) => break,
            Ok(n) => flushed += n,
            Err(_) => break,
        }
    }
    if flushed > 0 {
        debug!("Flushed {} stale byte(s) from source", flushed);
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DaqifiError, Result};
    use crate::framing::RecordFramer;
    use crate::wire::DeviceMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use prost::Message as _;
    use std::collections::VecDeque;

    /// Source replaying scripted chunks, then idling
    struct ScriptedSource {
        chunks: Arc<Mutex<VecDeque<Result<Vec<u8>>>>>,
    }

    impl ScriptedSource {
        fn new(chunks: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                chunks: Arc::new(Mutex::new(chunks.into_iter().collect())),
            }
        }
    }

    #[async_trait]
    impl ByteSource for ScriptedSource {
        async fn read_chunk(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let next = self.chunks.lock().pop_front();
            match next {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    // Simulate an idle stream hitting the read timeout
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(0)
                }
            }
        }
    }

    async fn collect_events(
        rx: &mut broadcast::Receiver<ConsumerEvent>,
        want: usize,
    ) -> Vec<ConsumerEvent> {
        let mut events = Vec::new();
        while events.len() < want {
            match timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Ok(event)) => events.push(event),
                _ => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn test_records_split_across_chunks() {
        let record = DeviceMessage {
            msg_time_stamp: Some(555),
            analog_in_data: vec![1, 2, 3],
            ..Default::default()
        };
        let encoded = record.encode_length_delimited_to_vec();
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        let source = ScriptedSource::new(vec![Ok(head.to_vec()), Ok(tail.to_vec())]);
        let mut consumer = Consumer::new(Duration::from_millis(50));
        let mut rx = consumer.subscribe();
        consumer.start(Box::new(source), Box::new(RecordFramer::new()));

        let events = collect_events(&mut rx, 1).await;
        match &events[..] {
            [ConsumerEvent::Message(ParsedMessage::Record(msg))] => {
                assert_eq!(msg.msg_time_stamp, Some(555));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        consumer.stop();
    }

    #[tokio::test]
    async fn test_parse_error_does_not_stop_loop() {
        let record = DeviceMessage {
            msg_time_stamp: Some(7),
            ..Default::default()
        };
        // Garbage chunk first, then a clean record
        let source = ScriptedSource::new(vec![
            Ok(vec![0x00, 0x00]),
            Ok(record.encode_length_delimited_to_vec()),
        ]);
        let mut consumer = Consumer::new(Duration::from_millis(50));
        let mut rx = consumer.subscribe();
        consumer.start(Box::new(source), Box::new(RecordFramer::new()));

        let events = collect_events(&mut rx, 2).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsumerEvent::Error(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsumerEvent::Message(ParsedMessage::Record(_)))));
        consumer.stop();
    }

    #[tokio::test]
    async fn test_io_error_reported_and_loop_continues() {
        let record = DeviceMessage {
            msg_time_stamp: Some(9),
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![
            Err(DaqifiError::IoError("transient".to_string())),
            Ok(record.encode_length_delimited_to_vec()),
        ]);
        let mut consumer = Consumer::new(Duration::from_millis(50));
        let mut rx = consumer.subscribe();
        consumer.start(Box::new(source), Box::new(RecordFramer::new()));

        let events = collect_events(&mut rx, 2).await;
        assert!(
            matches!(&events[0], ConsumerEvent::Error(DaqifiError::IoError(msg)) if msg.contains("transient"))
        );
        assert!(matches!(&events[1], ConsumerEvent::Message(_)));
        consumer.stop();
    }

    #[tokio::test]
    async fn test_stop_safely_returns_source() {
        let source = ScriptedSource::new(vec![]);
        let mut consumer = Consumer::new(Duration::from_millis(20));
        consumer.start(Box::new(source), Box::new(RecordFramer::new()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let returned = consumer.stop_safely(Duration::from_secs(1)).await;
        assert!(returned.is_some());
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn test_flush_source_discards_stale_bytes() {
        let mut source: Box<dyn ByteSource> =
            Box::new(ScriptedSource::new(vec![Ok(vec![1, 2, 3]), Ok(vec![4, 5])]));
        let flushed = flush_source(&mut source, Duration::from_millis(200)).await;
        assert_eq!(flushed, 5);
    }
}
