//! Channel model
//!
//! Analog and digital input/output channels with calibration-aware scaling
//! and per-sample notification. Channels are rebuilt from scratch whenever a
//! status record declares channel counts, so holders of old references must
//! resubscribe after a `ChannelsPopulated` event.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Signal direction of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelDirection {
    #[default]
    Input,
    Output,
}

/// Sampled value of either channel kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    Analog(f64),
    Digital(bool),
}

impl SampleValue {
    /// Numeric view of the value (digital maps to 0.0 / 1.0)
    pub fn as_f64(&self) -> f64 {
        match self {
            SampleValue::Analog(v) => *v,
            SampleValue::Digital(true) => 1.0,
            SampleValue::Digital(false) => 0.0,
        }
    }

    /// Boolean view of the value (analog is true when nonzero)
    pub fn as_bool(&self) -> bool {
        match self {
            SampleValue::Analog(v) => *v != 0.0,
            SampleValue::Digital(b) => *b,
        }
    }
}

/// One timestamped sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: SampleValue,
}

/// Calibration parameters for one analog channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalogCalibration {
    /// Calibration slope
    pub slope: f64,
    /// Calibration offset
    pub offset: f64,
    /// Internal scale factor
    pub internal_scale: f64,
    /// Port voltage range
    pub port_range: f64,
    /// Full-scale raw count (must be nonzero)
    pub resolution: u32,
}

impl Default for AnalogCalibration {
    fn default() -> Self {
        Self {
            slope: 1.0,
            offset: 0.0,
            internal_scale: 1.0,
            port_range: 1.0,
            resolution: 65_535,
        }
    }
}

/// Analog input/output channel
pub struct AnalogChannel {
    index: u32,
    name: String,
    enabled: AtomicBool,
    direction: ChannelDirection,
    calibration: AnalogCalibration,
    state: Mutex<Option<Sample>>,
    samples: broadcast::Sender<Sample>,
}

impl AnalogChannel {
    /// Create channel `AI<index>` with the given calibration
    pub fn new(index: u32, calibration: AnalogCalibration) -> Self {
        let (samples, _) = broadcast::channel(64);
        Self {
            index,
            name: format!("AI{index}"),
            enabled: AtomicBool::new(false),
            direction: ChannelDirection::Input,
            calibration,
            state: Mutex::new(None),
            samples,
        }
    }

    /// Calibration parameters in effect
    pub fn calibration(&self) -> AnalogCalibration {
        self.calibration
    }

    /// Convert a raw ADC count to a scaled value
    pub fn scaled_value(&self, raw: i32) -> f64 {
        let cal = &self.calibration;
        let resolution = f64::from(cal.resolution.max(1));
        ((f64::from(raw) / resolution) * cal.port_range * cal.slope + cal.offset)
            * cal.internal_scale
    }

    /// Smallest scaled value the channel can report
    pub fn range_min(&self) -> f64 {
        self.scaled_value(0).min(self.scaled_value(self.calibration.resolution as i32))
    }

    /// Largest scaled value the channel can report
    pub fn range_max(&self) -> f64 {
        self.scaled_value(0).max(self.scaled_value(self.calibration.resolution as i32))
    }

    /// Store a new sample and notify subscribers
    pub fn set_active_sample(&self, value: f64, timestamp: DateTime<Utc>) {
        let sample = Sample {
            timestamp,
            value: SampleValue::Analog(value),
        };
        *self.state.lock() = Some(sample);
        let _ = self.samples.send(sample);
    }
}

/// Digital input/output channel
pub struct DigitalChannel {
    index: u32,
    name: String,
    enabled: AtomicBool,
    direction: ChannelDirection,
    state: Mutex<Option<Sample>>,
    samples: broadcast::Sender<Sample>,
}

impl DigitalChannel {
    /// Create channel `DIO<index>` with the given direction
    pub fn new(index: u32, direction: ChannelDirection) -> Self {
        let (samples, _) = broadcast::channel(64);
        Self {
            index,
            name: format!("DIO{index}"),
            enabled: AtomicBool::new(false),
            direction,
            state: Mutex::new(None),
            samples,
        }
    }

    /// Store a new sample and notify subscribers
    pub fn set_active_sample(&self, state: bool, timestamp: DateTime<Utc>) {
        let sample = Sample {
            timestamp,
            value: SampleValue::Digital(state),
        };
        *self.state.lock() = Some(sample);
        let _ = self.samples.send(sample);
    }
}

/// A device channel of either kind
pub enum Channel {
    Analog(AnalogChannel),
    Digital(DigitalChannel),
}

impl Channel {
    /// Channel index within its kind
    pub fn index(&self) -> u32 {
        match self {
            Channel::Analog(c) => c.index,
            Channel::Digital(c) => c.index,
        }
    }

    /// Display name (`AI<n>` or `DIO<n>`)
    pub fn name(&self) -> &str {
        match self {
            Channel::Analog(c) => &c.name,
            Channel::Digital(c) => &c.name,
        }
    }

    /// Whether the channel is enabled for acquisition
    pub fn enabled(&self) -> bool {
        match self {
            Channel::Analog(c) => c.enabled.load(Ordering::Acquire),
            Channel::Digital(c) => c.enabled.load(Ordering::Acquire),
        }
    }

    /// Enable or disable the channel
    pub fn set_enabled(&self, enabled: bool) {
        match self {
            Channel::Analog(c) => c.enabled.store(enabled, Ordering::Release),
            Channel::Digital(c) => c.enabled.store(enabled, Ordering::Release),
        }
    }

    /// Signal direction
    pub fn direction(&self) -> ChannelDirection {
        match self {
            Channel::Analog(c) => c.direction,
            Channel::Digital(c) => c.direction,
        }
    }

    /// Most recent sample, if any
    pub fn last_sample(&self) -> Option<Sample> {
        match self {
            Channel::Analog(c) => *c.state.lock(),
            Channel::Digital(c) => *c.state.lock(),
        }
    }

    /// Subscribe to sample notifications
    pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
        match self {
            Channel::Analog(c) => c.samples.subscribe(),
            Channel::Digital(c) => c.samples.subscribe(),
        }
    }

    /// Value-copy view for events and serialization
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            index: self.index(),
            name: self.name().to_string(),
            kind: match self {
                Channel::Analog(_) => ChannelKind::Analog,
                Channel::Digital(_) => ChannelKind::Digital,
            },
            enabled: self.enabled(),
            direction: self.direction(),
            last_sample: self.last_sample(),
        }
    }
}

/// Channel kind tag for snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Analog,
    Digital,
}

/// Defensive copy of a channel's public state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub index: u32,
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub direction: ChannelDirection,
    pub last_sample: Option<Sample>,
}
