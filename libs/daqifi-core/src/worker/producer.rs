//! Outbound command producer
//!
//! FIFO queue of text commands drained to the transport write half by a
//! single background task. Messages from any thread enter one queue, so
//! writes to the stream are never reordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{DaqifiError, Result};
use crate::transport::ByteSink;

/// Background worker draining queued commands to a byte sink
pub struct Producer {
    tx: Option<mpsc::UnboundedSender<String>>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl Default for Producer {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer {
    /// Create a stopped producer
    pub fn new() -> Self {
        Self {
            tx: None,
            handle: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check whether the worker is accepting messages
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the drain worker over the given sink; a second start is a no-op
    pub fn start(&mut self, mut sink: Box<dyn ByteSink>) {
        if self.is_running() {
            debug!("Producer already running; start ignored");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                trace!("TX {} bytes: {}", command.len(), command.trim_end());
                if let Err(e) = sink.write_chunk(command.as_bytes()).await {
                    // The consumer observes the broken stream; keep draining
                    // so a safe stop can still complete
                    warn!("Failed to write outbound command: {}", e);
                }
            }
            debug!("Producer queue closed; worker exiting");
        });

        self.tx = Some(tx);
        self.handle = Some(handle);
    }

    /// Enqueue one outbound command
    ///
    /// Fails with `NotRunning` while stopped and `EmptyMessage` for
    /// empty or whitespace-only input. Callable from any thread.
    pub fn send(&self, message: &str) -> Result<()> {
        if !self.is_running() {
            return Err(DaqifiError::NotRunning);
        }
        if message.trim().is_empty() {
            return Err(DaqifiError::EmptyMessage);
        }
        let tx = self.tx.as_ref().ok_or(DaqifiError::NotRunning)?;
        tx.send(message.to_string())
            .map_err(|_| DaqifiError::NotRunning)
    }

    /// Stop immediately, discarding any queued commands
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Stop after draining the queue, waiting at most `drain_timeout`
    ///
    /// Returns whether the drain completed. Never fails on timeout; the
    /// worker is aborted if the deadline passes.
    pub async fn stop_safely(&mut self, drain_timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        // Closing the channel lets the worker finish the backlog and exit
        self.tx = None;

        let Some(handle) = self.handle.take() else {
            return true;
        };
        match timeout(drain_timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Producer drain timed out; aborting worker");
                false
            }
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Sink recording every write for inspection
    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl ByteSink for RecordingSink {
        async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
            self.writes.lock().push(data.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let producer = Producer::new();
        assert!(matches!(
            producer.send("SYSTem:ECHO -1\r\n"),
            Err(DaqifiError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let mut producer = Producer::new();
        producer.start(Box::new(RecordingSink::default()));
        assert!(matches!(producer.send(""), Err(DaqifiError::EmptyMessage)));
        assert!(matches!(producer.send("  \r\n"), Err(DaqifiError::EmptyMessage)));
    }

    #[tokio::test]
    async fn test_messages_drain_in_fifo_order() {
        let sink = RecordingSink::default();
        let writes = Arc::clone(&sink.writes);

        let mut producer = Producer::new();
        producer.start(Box::new(sink));
        producer.send("first\r\n").unwrap();
        producer.send("second\r\n").unwrap();
        producer.send("third\r\n").unwrap();

        assert!(producer.stop_safely(Duration::from_secs(1)).await);
        let got = writes.lock().clone();
        assert_eq!(got, vec![b"first\r\n".to_vec(), b"second\r\n".to_vec(), b"third\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let mut producer = Producer::new();
        producer.start(Box::new(RecordingSink::default()));
        producer.stop();
        assert!(matches!(
            producer.send("SYSTem:ECHO -1\r\n"),
            Err(DaqifiError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let sink = RecordingSink::default();
        let writes = Arc::clone(&sink.writes);

        let mut producer = Producer::new();
        producer.start(Box::new(sink));
        producer.start(Box::new(RecordingSink::default()));
        producer.send("only\r\n").unwrap();

        assert!(producer.stop_safely(Duration::from_secs(1)).await);
        assert_eq!(writes.lock().len(), 1);
    }
}
