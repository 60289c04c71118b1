//! Device record message
//!
//! Hand-written prost definition of the record the device emits on both the
//! TCP data channel and the UDP discovery reply. A single message type
//! carries every field; which ones are present decides its role.

use prost::Message;

/// One device record
///
/// All fields are optional or repeated: the device populates whatever the
/// record role calls for and firmware revisions differ in which
/// configuration fields they include.
#[derive(Clone, PartialEq, Message)]
pub struct DeviceMessage {
    /// Device tick counter at sample time (wraps at 2^32)
    #[prost(uint32, optional, tag = "1")]
    pub msg_time_stamp: Option<u32>,

    /// Raw analog samples, one per enabled channel
    #[prost(sint32, repeated, tag = "2")]
    pub analog_in_data: Vec<i32>,

    /// Pre-scaled analog samples; preferred over `analog_in_data` when present
    #[prost(float, repeated, tag = "3")]
    pub analog_in_data_float: Vec<f32>,

    /// Per-channel tick timestamps
    #[prost(uint32, repeated, tag = "4")]
    pub analog_in_data_ts: Vec<u32>,

    /// Digital sample bits, LSB of the first byte = DIO0
    #[prost(bytes = "vec", optional, tag = "5")]
    pub digital_data: Option<Vec<u8>>,

    /// Per-channel tick timestamps for digital samples
    #[prost(uint32, repeated, tag = "6")]
    pub digital_data_ts: Vec<u32>,

    /// Overall device status word
    #[prost(uint32, optional, tag = "7")]
    pub device_status: Option<u32>,

    /// Power state (1 = on)
    #[prost(uint32, optional, tag = "8")]
    pub pwr_status: Option<u32>,

    /// Battery charge percentage
    #[prost(uint32, optional, tag = "9")]
    pub batt_status: Option<u32>,

    /// Device temperature reading
    #[prost(sint32, optional, tag = "10")]
    pub temp_status: Option<i32>,

    /// Number of analog input ports
    #[prost(uint32, optional, tag = "11")]
    pub analog_in_port_num: Option<u32>,

    /// ADC resolution (full-scale raw count)
    #[prost(uint32, optional, tag = "12")]
    pub analog_in_res: Option<u32>,

    /// Per-channel calibration slope
    #[prost(float, repeated, tag = "13")]
    pub analog_in_cal_m: Vec<f32>,

    /// Per-channel calibration offset
    #[prost(float, repeated, tag = "14")]
    pub analog_in_cal_b: Vec<f32>,

    /// Per-channel internal scale factor
    #[prost(float, repeated, tag = "15")]
    pub analog_in_int_scale_m: Vec<f32>,

    /// Per-channel port voltage range
    #[prost(float, repeated, tag = "16")]
    pub analog_in_port_range: Vec<f32>,

    /// Bitmask of single-ended analog ports
    #[prost(uint32, optional, tag = "17")]
    pub analog_in_port_rse: Option<u32>,

    /// Number of digital ports
    #[prost(uint32, optional, tag = "18")]
    pub digital_port_num: Option<u32>,

    /// Digital direction bits, LSB of the first byte = DIO0, set = output
    #[prost(bytes = "vec", optional, tag = "19")]
    pub digital_port_dir: Option<Vec<u8>>,

    /// Device part number
    #[prost(string, optional, tag = "20")]
    pub device_pn: Option<String>,

    /// Hardware revision
    #[prost(string, optional, tag = "21")]
    pub device_hw_rev: Option<String>,

    /// Firmware revision
    #[prost(string, optional, tag = "22")]
    pub device_fw_rev: Option<String>,

    /// Device serial number
    #[prost(uint64, optional, tag = "23")]
    pub device_sn: Option<u64>,

    /// TCP port the device listens on
    #[prost(uint32, optional, tag = "24")]
    pub device_port: Option<u32>,

    /// Device host name
    #[prost(string, optional, tag = "25")]
    pub host_name: Option<String>,

    /// WiFi SSID the device is joined to or serving
    #[prost(string, optional, tag = "26")]
    pub ssid: Option<String>,

    /// WiFi security mode selector
    #[prost(uint32, optional, tag = "27")]
    pub wifi_security_mode: Option<u32>,

    /// WiFi infrastructure mode selector
    #[prost(uint32, optional, tag = "28")]
    pub wifi_inf_mode: Option<u32>,

    /// IPv4 address, 4 bytes
    #[prost(bytes = "vec", optional, tag = "29")]
    pub ip_addr: Option<Vec<u8>>,

    /// MAC address, 6 bytes
    #[prost(bytes = "vec", optional, tag = "30")]
    pub mac_addr: Option<Vec<u8>>,
}

/// Role of a record on the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// Device identity and channel configuration
    Status,
    /// Sampled data
    Stream,
}

impl DeviceMessage {
    /// Check whether the record carries a sample payload
    pub fn has_sample_payload(&self) -> bool {
        self.msg_time_stamp.is_some()
            || !self.analog_in_data.is_empty()
            || !self.analog_in_data_float.is_empty()
            || self.digital_data.is_some()
    }

    /// Check whether the record declares channel counts
    pub fn has_channel_config(&self) -> bool {
        self.analog_in_port_num.is_some() || self.digital_port_num.is_some()
    }

    /// Classify the record; absence of sample payload fields implies status
    pub fn role(&self) -> MessageRole {
        if self.has_sample_payload() {
            MessageRole::Stream
        } else {
            MessageRole::Status
        }
    }
}
