//! Outbound SCPI command builders
//!
//! Every command is an ASCII line terminated by CRLF. Builders return owned
//! strings ready for the producer queue.

/// Record stream wire format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// Length-delimited binary records (normal operation)
    Protobuf = 0,
    /// JSON-formatted samples
    Json = 1,
    /// Human-readable diagnostic output
    Diagnostic = 2,
}

/// Highest supported stream frequency in Hz
pub const MAX_STREAM_FREQUENCY: u32 = 1000;

/// Disable command echo (normal operation)
pub fn disable_echo() -> String {
    "SYSTem:ECHO -1\r\n".to_string()
}

/// Enable command echo (interactive debugging)
pub fn enable_echo() -> String {
    "SYSTem:ECHO 1\r\n".to_string()
}

/// Power on the measurement subsystem
pub fn power_on() -> String {
    "SYSTem:POWer:STATe 1\r\n".to_string()
}

/// Select the record stream wire format
pub fn stream_format(format: RecordFormat) -> String {
    format!("SYSTem:STReam:FORmat {}\r\n", format as u32)
}

/// Start streaming at the given frequency, clamped to 1..=1000 Hz
pub fn start_streaming(frequency: u32) -> String {
    let freq = frequency.clamp(1, MAX_STREAM_FREQUENCY);
    format!("SYSTem:StartStreamData {freq}\r\n")
}

/// Stop an active stream
pub fn stop_streaming() -> String {
    "SYSTem:StopStreamData\r\n".to_string()
}

/// Request the device info record
pub fn system_info() -> String {
    "SYSTem:SYSInfoPB?\r\n".to_string()
}

/// Enable ADC channels by bitmask, LSB = channel 0
pub fn enable_adc_channels(mask: u32) -> String {
    format!("ENAble:VOLTage:DC {mask}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_crlf_terminated() {
        for cmd in [
            disable_echo(),
            enable_echo(),
            power_on(),
            stream_format(RecordFormat::Protobuf),
            start_streaming(100),
            stop_streaming(),
            system_info(),
            enable_adc_channels(0b101),
        ] {
            assert!(cmd.ends_with("\r\n"), "missing terminator: {cmd:?}");
        }
    }

    #[test]
    fn test_stream_frequency_clamp() {
        assert_eq!(start_streaming(0), "SYSTem:StartStreamData 1\r\n");
        assert_eq!(start_streaming(500), "SYSTem:StartStreamData 500\r\n");
        assert_eq!(start_streaming(99_999), "SYSTem:StartStreamData 1000\r\n");
    }

    #[test]
    fn test_stream_format_values() {
        assert_eq!(stream_format(RecordFormat::Protobuf), "SYSTem:STReam:FORmat 0\r\n");
        assert_eq!(stream_format(RecordFormat::Json), "SYSTem:STReam:FORmat 1\r\n");
        assert_eq!(stream_format(RecordFormat::Diagnostic), "SYSTem:STReam:FORmat 2\r\n");
    }

    #[test]
    fn test_channel_enable_mask() {
        assert_eq!(enable_adc_channels(5), "ENAble:VOLTage:DC 5\r\n");
    }
}
