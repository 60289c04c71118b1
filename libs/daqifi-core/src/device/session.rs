//! Device session
//!
//! Full-duplex orchestration of one device connection: transport lifecycle,
//! producer and consumer workers, the initialization handshake, record
//! routing into metadata/channels, and the temporary text-mode capture used
//! for plain-text queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::channel::{
    AnalogCalibration, AnalogChannel, Channel, ChannelDirection, ChannelSnapshot, DigitalChannel,
};
use crate::device::metadata::DeviceMetadata;
use crate::discovery::DeviceDescriptor;
use crate::error::{DaqifiError, Result};
use crate::framing::{CompositeFramer, LineFramer, ParsedMessage};
use crate::retry::RetryPolicy;
use crate::timestamp::TimestampProcessor;
use crate::transport::{ConnectionStatus, TcpTransport, TcpTransportConfig};
use crate::wire::commands::{self, RecordFormat};
use crate::wire::{DeviceMessage, MessageRole};
use crate::worker::{flush_source, Consumer, ConsumerEvent, Producer};

/// Prefix of a device error reply line
const DEVICE_ERROR_PREFIX: &str = "**ERROR: -";

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    Streaming,
    /// Transport dropped while the session was active
    Lost,
    /// Initialization failed unrecoverably
    Error,
}

impl SessionState {
    /// Check whether outbound commands are accepted in this state
    pub fn accepts_commands(&self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::Initializing
                | SessionState::Ready
                | SessionState::Streaming
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Initializing => write!(f, "INITIALIZING"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Streaming => write!(f, "STREAMING"),
            SessionState::Lost => write!(f, "LOST"),
            SessionState::Error => write!(f, "ERROR"),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device endpoint
    pub endpoint: TcpTransportConfig,
    /// Connect retry policy
    pub retry: RetryPolicy,
    /// Pause between handshake commands
    pub command_pacing: Duration,
    /// Pause after the device info query
    pub info_pacing: Duration,
    /// Deadline for cooperative worker stops
    pub stop_timeout: Duration,
    /// Window for draining stale bytes at connect
    pub flush_window: Duration,
}

impl SessionConfig {
    /// Create a configuration for the given endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: TcpTransportConfig::new(host, port),
            retry: RetryPolicy::default(),
            command_pacing: Duration::from_millis(100),
            info_pacing: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(1),
            flush_window: Duration::from_millis(100),
        }
    }

    /// Create a configuration from a discovery descriptor
    pub fn for_descriptor(descriptor: &DeviceDescriptor) -> Self {
        Self::new(descriptor.ip_address.clone(), descriptor.tcp_port)
    }
}

/// Event emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection status change, with the triggering error when there is one
    StatusChanged {
        status: ConnectionStatus,
        error: Option<String>,
    },
    /// A stream record arrived (samples already applied to channels)
    RecordReceived(Box<DeviceMessage>),
    /// Channel list was rebuilt from a status record
    ChannelsPopulated {
        channels: Vec<ChannelSnapshot>,
        analog_count: usize,
        digital_count: usize,
    },
    /// A text line arrived on the data channel
    TextLine(String),
    /// A non-fatal stream problem (parse failure, transient IO error)
    Error(String),
}

/// One full-duplex device session
pub struct DeviceSession {
    config: SessionConfig,
    transport: TcpTransport,
    producer: Producer,
    consumer: Option<Consumer>,
    consumer_events: broadcast::Sender<ConsumerEvent>,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    metadata: Arc<RwLock<DeviceMetadata>>,
    channels: Arc<RwLock<Vec<Arc<Channel>>>>,
    timestamps: Arc<TimestampProcessor>,
    protocol_fault: Arc<Mutex<Option<String>>>,
    initialized: bool,
    routing_handle: Option<JoinHandle<()>>,
    status_handle: Option<JoinHandle<()>>,
    device_label: String,
}

impl DeviceSession {
    /// Create a session for the configured endpoint
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (consumer_events, _) = broadcast::channel(1024);
        let device_label = format!("{}:{}", config.endpoint.host, config.endpoint.port);
        let transport = TcpTransport::new(config.endpoint.clone());
        Self {
            config,
            transport,
            producer: Producer::new(),
            consumer: None,
            consumer_events,
            events,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            metadata: Arc::new(RwLock::new(DeviceMetadata::default())),
            channels: Arc::new(RwLock::new(Vec::new())),
            timestamps: Arc::new(TimestampProcessor::new()),
            protocol_fault: Arc::new(Mutex::new(None)),
            initialized: false,
            routing_handle: None,
            status_handle: None,
            device_label,
        }
    }

    /// Create a session from a discovery descriptor
    pub fn for_descriptor(descriptor: &DeviceDescriptor) -> Self {
        Self::new(SessionConfig::for_descriptor(descriptor))
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Snapshot of the accumulated device metadata
    pub fn metadata(&self) -> DeviceMetadata {
        self.metadata.read().clone()
    }

    /// Live channel handles (replaced wholesale on every rebuild)
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().clone()
    }

    /// Timestamp processor keyed by this session's device
    pub fn timestamps(&self) -> Arc<TimestampProcessor> {
        Arc::clone(&self.timestamps)
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Session {} state {} -> {}", self.device_label, *current, state);
            *current = state;
        }
    }

    fn emit_status(&self, status: ConnectionStatus, error: Option<String>) {
        let _ = self.events.send(SessionEvent::StatusChanged { status, error });
    }

    /// Connect the transport and start both workers
    ///
    /// On success the session is `Connected` and inbound records flow into
    /// metadata, channels, and the event stream. Failure rolls the state
    /// back to `Disconnected` and propagates the error.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state().accepts_commands() {
            debug!("Session already connected");
            return Ok(());
        }

        // A reconnect after loss starts from a clean worker slate
        if let Some(handle) = self.status_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.routing_handle.take() {
            handle.abort();
        }
        if let Some(mut consumer) = self.consumer.take() {
            let _ = consumer.stop_safely(self.config.stop_timeout).await;
        }
        if self.producer.is_running() {
            self.producer.stop_safely(self.config.stop_timeout).await;
        }
        self.initialized = false;

        self.set_state(SessionState::Connecting);
        self.emit_status(ConnectionStatus::Connecting, None);

        if let Err(e) = self.transport.connect(&self.config.retry).await {
            self.set_state(SessionState::Disconnected);
            self.emit_status(ConnectionStatus::Disconnected, Some(e.to_string()));
            return Err(e);
        }

        let (mut source, sink) = match self.transport.take_split() {
            Ok(halves) => halves,
            Err(e) => {
                self.transport.disconnect().await;
                self.set_state(SessionState::Disconnected);
                self.emit_status(ConnectionStatus::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };

        // Throw away anything the device sent before we were listening
        flush_source(&mut source, self.config.flush_window).await;

        self.producer.start(sink);
        let mut consumer =
            Consumer::with_events(self.transport.read_timeout(), self.consumer_events.clone());
        consumer.start(source, Box::new(CompositeFramer::new()));
        self.consumer = Some(consumer);

        self.spawn_routing();
        self.spawn_status_watcher();

        self.set_state(SessionState::Connected);
        self.emit_status(ConnectionStatus::Connected, None);
        info!("Session connected to {}", self.device_label);
        Ok(())
    }

    /// Run the initialization handshake
    ///
    /// Disables echo, stops any stale stream, powers the device on, selects
    /// the binary record format, and requests the info record. Idempotent
    /// once the session is `Ready`. Any failure moves the session to
    /// `Error` and propagates.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.initialized
            && matches!(self.state(), SessionState::Ready | SessionState::Streaming)
        {
            debug!("Session already initialized");
            return Ok(());
        }
        if self.state() != SessionState::Connected {
            return Err(DaqifiError::NotConnected);
        }

        self.set_state(SessionState::Initializing);
        *self.protocol_fault.lock() = None;

        match self.run_handshake().await {
            Ok(()) => {
                self.initialized = true;
                self.set_state(SessionState::Ready);
                info!("Session {} initialized", self.device_label);
                Ok(())
            }
            Err(e) => {
                warn!("Initialization failed: {}", e);
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    async fn run_handshake(&self) -> Result<()> {
        let paced = [
            commands::disable_echo(),
            commands::stop_streaming(),
            commands::power_on(),
            commands::stream_format(RecordFormat::Protobuf),
        ];
        for command in &paced {
            self.producer.send(command)?;
            tokio::time::sleep(self.config.command_pacing).await;
        }
        self.producer.send(&commands::system_info())?;
        tokio::time::sleep(self.config.info_pacing).await;

        if let Some(line) = self.protocol_fault.lock().take() {
            return Err(DaqifiError::ProtocolError(format!(
                "device rejected initialization: {line}"
            )));
        }
        Ok(())
    }

    /// Enqueue one outbound text command
    pub fn send(&self, command: &str) -> Result<()> {
        if !self.state().accepts_commands() {
            return Err(DaqifiError::NotConnected);
        }
        self.producer.send(command)
    }

    /// Raw binary outbound payloads have no configured path to the device
    pub fn send_raw(&self, _data: &[u8]) -> Result<()> {
        Err(DaqifiError::NotSupported(
            "no byte-oriented outbound path is configured".to_string(),
        ))
    }

    /// Start sample streaming at the given frequency (1..=1000 Hz)
    pub fn start_streaming(&self, frequency: u32) -> Result<()> {
        if !matches!(self.state(), SessionState::Ready | SessionState::Streaming) {
            return Err(DaqifiError::NotConnected);
        }
        self.send(&commands::start_streaming(frequency))?;
        self.set_state(SessionState::Streaming);
        Ok(())
    }

    /// Stop sample streaming
    pub fn stop_streaming(&self) -> Result<()> {
        if !matches!(self.state(), SessionState::Ready | SessionState::Streaming) {
            return Err(DaqifiError::NotConnected);
        }
        self.send(&commands::stop_streaming())?;
        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// Enable ADC channels by bitmask (LSB = AI0) and mirror the flags on
    /// the channel objects
    pub fn set_channels_enabled(&self, mask: u32) -> Result<()> {
        self.send(&commands::enable_adc_channels(mask))?;
        for channel in self.channels.read().iter() {
            if matches!(channel.as_ref(), Channel::Analog(_)) {
                channel.set_enabled((mask >> channel.index()) & 1 == 1);
            }
        }
        Ok(())
    }

    /// Run text-mode commands and collect the plain-text reply lines
    ///
    /// Pauses the record consumer, runs a line-mode consumer over the same
    /// byte source while `setup` sends its commands, collects lines for
    /// `response_timeout`, then restores the record consumer.
    /// `completion_timeout` bounds each consumer handoff. The record
    /// consumer is restored even when `setup` or collection fails.
    pub async fn execute_text_command<F>(
        &mut self,
        setup: F,
        response_timeout: Duration,
        completion_timeout: Duration,
    ) -> Result<Vec<String>>
    where
        F: FnOnce(&Producer) -> Result<()>,
    {
        if !self.state().accepts_commands() {
            return Err(DaqifiError::NotConnected);
        }
        let consumer = self.consumer.as_mut().ok_or(DaqifiError::NotConnected)?;
        let Some(source) = consumer.stop_safely(completion_timeout).await else {
            return Err(DaqifiError::IoError(
                "record consumer did not pause for text mode".to_string(),
            ));
        };

        let mut line_consumer =
            Consumer::with_events(self.transport.read_timeout(), self.consumer_events.clone());
        let mut lines_rx = line_consumer.subscribe();
        line_consumer.start(source, Box::new(LineFramer::new()));

        let setup_result = setup(&self.producer);

        let mut lines = Vec::new();
        if setup_result.is_ok() {
            let deadline = tokio::time::Instant::now() + response_timeout;
            loop {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                match tokio::time::timeout(deadline - now, lines_rx.recv()).await {
                    Ok(Ok(ConsumerEvent::Message(ParsedMessage::Line(line)))) => lines.push(line),
                    Ok(Ok(_)) => {}
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_) => break,
                }
            }
        }

        // Restore record mode regardless of how collection went
        match line_consumer.stop_safely(completion_timeout).await {
            Some(source) => {
                let mut record_consumer = Consumer::with_events(
                    self.transport.read_timeout(),
                    self.consumer_events.clone(),
                );
                record_consumer.start(source, Box::new(CompositeFramer::new()));
                self.consumer = Some(record_consumer);
            }
            None => {
                warn!("Byte source lost while leaving text mode");
                self.consumer = None;
            }
        }

        setup_result?;
        if self.consumer.is_none() {
            return Err(DaqifiError::IoError(
                "failed to resume record consumer after text mode".to_string(),
            ));
        }
        Ok(lines)
    }

    /// Disconnect and stop all workers; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        // Stop observers first so deliberate teardown is not reported as loss
        if let Some(handle) = self.status_handle.take() {
            handle.abort();
        }
        if let Some(mut consumer) = self.consumer.take() {
            if consumer.stop_safely(self.config.stop_timeout).await.is_none() {
                debug!("Consumer byte source dropped with the connection");
            }
        }
        self.producer.stop_safely(self.config.stop_timeout).await;
        if let Some(handle) = self.routing_handle.take() {
            handle.abort();
        }
        self.transport.disconnect().await;
        self.initialized = false;
        self.set_state(SessionState::Disconnected);
        self.emit_status(ConnectionStatus::Disconnected, None);
        info!("Session {} disconnected", self.device_label);
    }

    /// Tear down the session and dispose the transport
    pub async fn dispose(&mut self) {
        self.disconnect().await;
        self.transport.dispose().await;
    }

    fn spawn_routing(&mut self) {
        let mut rx = self.consumer_events.subscribe();
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let metadata = Arc::clone(&self.metadata);
        let channels = Arc::clone(&self.channels);
        let timestamps = Arc::clone(&self.timestamps);
        let protocol_fault = Arc::clone(&self.protocol_fault);
        let device_label = self.device_label.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConsumerEvent::Message(message)) => route_message(
                        message,
                        &events,
                        &metadata,
                        &channels,
                        &timestamps,
                        &protocol_fault,
                        &device_label,
                    ),
                    Ok(ConsumerEvent::Error(e)) => {
                        let _ = events.send(SessionEvent::Error(e.to_string()));
                        if e.is_connection_error() {
                            mark_lost(&state, &events, Some(e.to_string()));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Record routing lagged by {} event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.routing_handle = Some(handle);
    }

    fn spawn_status_watcher(&mut self) {
        let mut rx = self.transport.subscribe_status();
        let state = Arc::clone(&self.state);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let event = rx.borrow_and_update().clone();
                let Some(status) = event.status else { continue };
                if !status.is_connected() {
                    mark_lost(&state, &events, event.error);
                }
            }
        });
        self.status_handle = Some(handle);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(handle) = self.status_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.routing_handle.take() {
            handle.abort();
        }
    }
}

/// Move an active session to `Lost`; no-op in any other state
fn mark_lost(
    state: &RwLock<SessionState>,
    events: &broadcast::Sender<SessionEvent>,
    error: Option<String>,
) {
    let mut current = state.write();
    if matches!(
        *current,
        SessionState::Connected | SessionState::Ready | SessionState::Streaming
    ) {
        *current = SessionState::Lost;
        drop(current);
        warn!("Session connection lost");
        let _ = events.send(SessionEvent::StatusChanged {
            status: ConnectionStatus::Lost,
            error,
        });
    }
}

/// Route one inbound message into session state and events
fn route_message(
    message: ParsedMessage,
    events: &broadcast::Sender<SessionEvent>,
    metadata: &RwLock<DeviceMetadata>,
    channels: &RwLock<Vec<Arc<Channel>>>,
    timestamps: &TimestampProcessor,
    protocol_fault: &Mutex<Option<String>>,
    device_label: &str,
) {
    match message {
        ParsedMessage::Line(line) => {
            if line.starts_with(DEVICE_ERROR_PREFIX) {
                warn!("Device error reply: {}", line);
                *protocol_fault.lock() = Some(line.clone());
            }
            let _ = events.send(SessionEvent::TextLine(line));
        }
        ParsedMessage::Record(msg) => {
            // Firmware sometimes rides status fields on stream records;
            // merge under non-empty-wins before anything else
            metadata.write().merge_from(&msg);
            if msg.has_channel_config() {
                populate_channels_from_status(channels, events, &msg);
            }
            if msg.role() == MessageRole::Stream {
                apply_stream_samples(channels, timestamps, metadata, device_label, &msg);
                let _ = events.send(SessionEvent::RecordReceived(msg));
            }
        }
        // Opaque payloads only come from raw-mode framers, never the session's
        ParsedMessage::Payload(_) => {}
    }
}

/// Rebuild the channel list from a status record's counts and calibration
fn populate_channels_from_status(
    channels: &RwLock<Vec<Arc<Channel>>>,
    events: &broadcast::Sender<SessionEvent>,
    msg: &DeviceMessage,
) {
    let analog_count = msg.analog_in_port_num.unwrap_or(0) as usize;
    let digital_count = msg.digital_port_num.unwrap_or(0) as usize;

    let mut rebuilt: Vec<Arc<Channel>> = Vec::with_capacity(analog_count + digital_count);
    for i in 0..analog_count {
        let calibration = AnalogCalibration {
            slope: msg.analog_in_cal_m.get(i).copied().map_or(1.0, f64::from),
            offset: msg.analog_in_cal_b.get(i).copied().map_or(0.0, f64::from),
            internal_scale: msg
                .analog_in_int_scale_m
                .get(i)
                .copied()
                .map_or(1.0, f64::from),
            port_range: msg
                .analog_in_port_range
                .get(i)
                .copied()
                .map_or(1.0, f64::from),
            resolution: msg.analog_in_res.filter(|r| *r > 0).unwrap_or(65_535),
        };
        rebuilt.push(Arc::new(Channel::Analog(AnalogChannel::new(
            i as u32,
            calibration,
        ))));
    }
    for i in 0..digital_count {
        let direction = msg
            .digital_port_dir
            .as_deref()
            .and_then(|bits| bits.get(i / 8).copied())
            .map_or(ChannelDirection::Input, |byte| {
                if (byte >> (i % 8)) & 1 == 1 {
                    ChannelDirection::Output
                } else {
                    ChannelDirection::Input
                }
            });
        rebuilt.push(Arc::new(Channel::Digital(DigitalChannel::new(
            i as u32, direction,
        ))));
    }

    let snapshot: Vec<ChannelSnapshot> = rebuilt.iter().map(|c| c.snapshot()).collect();
    *channels.write() = rebuilt;
    debug!(
        "Channels rebuilt: {} analog, {} digital",
        analog_count, digital_count
    );
    let _ = events.send(SessionEvent::ChannelsPopulated {
        channels: snapshot,
        analog_count,
        digital_count,
    });
}

/// Apply one stream record's samples to the channel objects
fn apply_stream_samples(
    channels: &RwLock<Vec<Arc<Channel>>>,
    timestamps: &TimestampProcessor,
    metadata: &RwLock<DeviceMetadata>,
    device_label: &str,
    msg: &DeviceMessage,
) {
    let clock_key = {
        let meta = metadata.read();
        if meta.serial_number.is_empty() {
            device_label.to_string()
        } else {
            meta.serial_number.clone()
        }
    };
    let timestamp = match msg.msg_time_stamp {
        Some(tick) => timestamps.process(&clock_key, tick).timestamp,
        None => Utc::now(),
    };

    let list = channels.read();
    let analog: Vec<&Arc<Channel>> = list
        .iter()
        .filter(|c| matches!(c.as_ref(), Channel::Analog(_)))
        .collect();
    let enabled: Vec<&Arc<Channel>> = analog.iter().filter(|c| c.enabled()).copied().collect();
    // Samples arrive for enabled channels in index order; a device that
    // streams before any enable command maps onto the full list
    let targets: &[&Arc<Channel>] = if enabled.is_empty() { &analog } else { &enabled };

    if !msg.analog_in_data_float.is_empty() {
        for (value, channel) in msg.analog_in_data_float.iter().zip(targets.iter()) {
            if let Channel::Analog(analog) = channel.as_ref() {
                analog.set_active_sample(f64::from(*value), timestamp);
            }
        }
    } else {
        for (raw, channel) in msg.analog_in_data.iter().zip(targets.iter()) {
            if let Channel::Analog(analog) = channel.as_ref() {
                analog.set_active_sample(analog.scaled_value(*raw), timestamp);
            }
        }
    }

    if let Some(bits) = msg.digital_data.as_deref() {
        let digitals = list
            .iter()
            .filter(|c| matches!(c.as_ref(), Channel::Digital(_)));
        for (i, channel) in digitals.enumerate() {
            if let Some(byte) = bits.get(i / 8) {
                let high = (byte >> (i % 8)) & 1 == 1;
                if let Channel::Digital(digital) = channel.as_ref() {
                    digital.set_active_sample(high, timestamp);
                }
            }
        }
    }
}
