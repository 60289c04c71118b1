//! Device tick timestamp reconstruction
//!
//! The device stamps samples with a 32-bit tick counter advancing at a fixed
//! period and wrapping at 2^32. This module anchors each device's counter to
//! wall-clock time at the first observation and converts later ticks into
//! absolute instants, detecting counter rollover along the way.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Default device tick period: 20 ns
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_nanos(20);

/// Gap above which a detected rollover is treated as an out-of-order message
///
/// A genuine wrap is only reachable after the counter runs its full horizon
/// of `2^32 * 20 ns ≈ 85.9 s`, but devices stream many samples per second, so
/// a rollover-shaped delta covering more than a few seconds almost certainly
/// means a datagram arrived late rather than that the counter wrapped.
pub const FALSE_ROLLOVER_THRESHOLD: Duration = Duration::from_secs(10);

/// Per-device clock state
#[derive(Debug, Clone)]
struct DeviceClock {
    last_tick: u32,
    anchor: DateTime<Utc>,
    elapsed_secs: f64,
}

/// Result of processing one tick observation
#[derive(Debug, Clone, PartialEq)]
pub struct TickObservation {
    /// Reconstructed absolute time of the sample
    pub timestamp: DateTime<Utc>,
    /// Whether the counter wrapped since the previous observation
    pub was_rollover: bool,
    /// Raw tick delta from the previous observation
    pub ticks_since_last: u64,
    /// Seconds represented by the delta; negative flags an out-of-order
    /// message that looked like a rollover
    pub seconds_since_last: f64,
    /// Whether this was the first observation for the device
    pub is_first: bool,
}

/// Converts wrapping device ticks into absolute timestamps, per device id
pub struct TimestampProcessor {
    clocks: DashMap<String, DeviceClock>,
    tick_period_secs: f64,
    false_rollover_secs: f64,
}

impl Default for TimestampProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampProcessor {
    /// Create a processor using the default 20 ns tick period
    pub fn new() -> Self {
        Self::with_tick_period(DEFAULT_TICK_PERIOD)
    }

    /// Create a processor with a custom tick period
    pub fn with_tick_period(tick_period: Duration) -> Self {
        Self {
            clocks: DashMap::new(),
            tick_period_secs: tick_period.as_secs_f64(),
            false_rollover_secs: FALSE_ROLLOVER_THRESHOLD.as_secs_f64(),
        }
    }

    /// Process one tick for the given device
    ///
    /// The entry guard serializes concurrent calls for the same device, so
    /// exactly one caller observes `is_first` per device lifetime.
    pub fn process(&self, device_id: &str, tick: u32) -> TickObservation {
        match self.clocks.entry(device_id.to_string()) {
            Entry::Vacant(vacant) => {
                let now = Utc::now();
                vacant.insert(DeviceClock {
                    last_tick: tick,
                    anchor: now,
                    elapsed_secs: 0.0,
                });
                debug!("Anchored device clock for {} at tick {}", device_id, tick);
                TickObservation {
                    timestamp: now,
                    was_rollover: false,
                    ticks_since_last: 0,
                    seconds_since_last: 0.0,
                    is_first: true,
                }
            }
            Entry::Occupied(mut occupied) => {
                let clock = occupied.get_mut();
                let (ticks, was_rollover) = if tick >= clock.last_tick {
                    (u64::from(tick - clock.last_tick), false)
                } else {
                    (
                        u64::from(u32::MAX - clock.last_tick) + u64::from(tick) + 1,
                        true,
                    )
                };

                let mut seconds = ticks as f64 * self.tick_period_secs;
                if was_rollover && seconds > self.false_rollover_secs {
                    // Too large to be a real wrap at streaming rates: an
                    // out-of-order message. Flag it with a negative gap but
                    // keep the tick so the stream recovers on the next
                    // in-order sample.
                    warn!(
                        "Out-of-order tick for {}: apparent rollover spanning {:.3} s",
                        device_id, seconds
                    );
                    seconds = -seconds;
                } else {
                    clock.elapsed_secs += seconds;
                }
                clock.last_tick = tick;

                let offset = chrono::Duration::nanoseconds((clock.elapsed_secs * 1e9) as i64);
                TickObservation {
                    timestamp: clock.anchor + offset,
                    was_rollover,
                    ticks_since_last: ticks,
                    seconds_since_last: seconds,
                    is_first: false,
                }
            }
        }
    }

    /// Forget the clock state for one device
    pub fn reset(&self, device_id: &str) {
        self.clocks.remove(device_id);
    }

    /// Forget all device clocks
    pub fn reset_all(&self) {
        self.clocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SN: &str = "77001234";

    #[test]
    fn test_first_observation_anchors_clock() {
        let processor = TimestampProcessor::new();
        let obs = processor.process(SN, 123);
        assert!(obs.is_first);
        assert!(!obs.was_rollover);
        assert_eq!(obs.ticks_since_last, 0);
    }

    #[test]
    fn test_monotonic_ticks_never_report_rollover() {
        let processor = TimestampProcessor::new();
        processor.process(SN, 0);
        let mut last_ts = None;
        for tick in [1_000u32, 50_000, 1_000_000, 4_000_000_000] {
            let obs = processor.process(SN, tick);
            assert!(!obs.was_rollover);
            assert!(obs.seconds_since_last >= 0.0);
            if let Some(prev) = last_ts {
                assert!(obs.timestamp >= prev);
            }
            last_ts = Some(obs.timestamp);
        }
    }

    #[test]
    fn test_rollover_within_one_second() {
        let processor = TimestampProcessor::new();
        processor.process(SN, u32::MAX - 25_000_000);
        let obs = processor.process(SN, 25_000_000);
        assert!(obs.was_rollover);
        assert!(
            obs.seconds_since_last > 0.9 && obs.seconds_since_last < 1.1,
            "gap was {}",
            obs.seconds_since_last
        );
    }

    #[test]
    fn test_false_rollover_reports_negative_gap() {
        let processor = TimestampProcessor::new();
        processor.process(SN, 1_000_000_000);
        let obs = processor.process(SN, 100_000_000);
        assert!(obs.was_rollover);
        assert!(obs.seconds_since_last < 0.0);

        // The late tick still became the reference point
        let next = processor.process(SN, 100_000_050);
        assert!(!next.was_rollover);
        assert_eq!(next.ticks_since_last, 50);
    }

    #[test]
    fn test_reset_forgets_device() {
        let processor = TimestampProcessor::new();
        processor.process(SN, 500);
        processor.reset(SN);
        let obs = processor.process(SN, 900);
        assert!(obs.is_first);
    }

    #[test]
    fn test_devices_are_independent() {
        let processor = TimestampProcessor::new();
        processor.process("a", 100);
        let obs = processor.process("b", 100);
        assert!(obs.is_first);
    }

    #[tokio::test]
    async fn test_concurrent_first_tick_is_unique() {
        let processor = Arc::new(TimestampProcessor::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let processor = Arc::clone(&processor);
            handles.push(tokio::spawn(async move {
                processor.process("shared", 42).is_first
            }));
        }
        let mut firsts = 0;
        for handle in handles {
            if handle.await.unwrap() {
                firsts += 1;
            }
        }
        assert_eq!(firsts, 1);
    }
}
