//! Device metadata
//!
//! Identity and capability fields accumulated from status records. Merge
//! policy is non-empty-wins: a field only overwrites the stored value when
//! the incoming record actually carries something.

use serde::{Deserialize, Serialize};

use crate::wire::DeviceMessage;

/// Device family derived from the part number prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Nyquist1,
    Nyquist2,
    Nyquist3,
    #[default]
    Unknown,
}

impl DeviceKind {
    /// Derive the device family from a part number, case-insensitively
    pub fn from_part_number(part_number: &str) -> Self {
        let pn = part_number.trim().to_ascii_lowercase();
        if pn.starts_with("nq1") || pn.starts_with("dqf-1000") {
            DeviceKind::Nyquist1
        } else if pn.starts_with("nq2") || pn.starts_with("dqf-2000") {
            DeviceKind::Nyquist2
        } else if pn.starts_with("nq3") || pn.starts_with("dqf-3000") {
            DeviceKind::Nyquist3
        } else {
            DeviceKind::Unknown
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Nyquist1 => write!(f, "Nyquist 1"),
            DeviceKind::Nyquist2 => write!(f, "Nyquist 2"),
            DeviceKind::Nyquist3 => write!(f, "Nyquist 3"),
            DeviceKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Render a 6-byte MAC field as hyphen-separated uppercase hex
///
/// Any other length renders as the empty string.
pub fn format_mac(bytes: &[u8]) -> String {
    if bytes.len() != 6 {
        return String::new();
    }
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Render a 4-byte IPv4 field as a dotted quad
///
/// Any other length renders as the empty string.
pub fn format_ip(bytes: &[u8]) -> String {
    if bytes.len() != 4 {
        return String::new();
    }
    format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Mutable device identity record populated from status payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub part_number: String,
    pub device_kind: DeviceKind,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub host_name: String,
    pub ssid: String,
    /// TCP port the device serves the data channel on
    pub device_port: u16,
    pub wifi_security_mode: u32,
    pub wifi_infrastructure_mode: u32,
    pub ip_address: String,
    pub mac_address: String,
    pub power_on: bool,
    pub battery_percent: u32,
    pub temperature: i32,
}

impl DeviceMetadata {
    /// Merge fields from a record; empty or zero incoming fields never
    /// overwrite existing values
    pub fn merge_from(&mut self, msg: &DeviceMessage) {
        merge_string(&mut self.host_name, msg.host_name.as_deref());
        merge_string(&mut self.ssid, msg.ssid.as_deref());
        merge_string(&mut self.firmware_revision, msg.device_fw_rev.as_deref());
        merge_string(&mut self.hardware_revision, msg.device_hw_rev.as_deref());

        if let Some(pn) = msg.device_pn.as_deref() {
            if !pn.is_empty() {
                self.part_number = pn.to_string();
                self.device_kind = DeviceKind::from_part_number(pn);
            }
        }
        if let Some(sn) = msg.device_sn {
            if sn != 0 {
                self.serial_number = sn.to_string();
            }
        }
        if let Some(port) = msg.device_port {
            if port != 0 {
                self.device_port = port as u16;
            }
        }
        if let Some(mode) = msg.wifi_security_mode {
            if mode != 0 {
                self.wifi_security_mode = mode;
            }
        }
        if let Some(mode) = msg.wifi_inf_mode {
            if mode != 0 {
                self.wifi_infrastructure_mode = mode;
            }
        }

        // Address fields re-format when present; a wrong-length field
        // clears the value rather than keeping a stale one
        if let Some(ip) = msg.ip_addr.as_deref() {
            self.ip_address = format_ip(ip);
        }
        if let Some(mac) = msg.mac_addr.as_deref() {
            self.mac_address = format_mac(mac);
        }

        if let Some(pwr) = msg.pwr_status {
            self.power_on = pwr == 1;
        }
        if let Some(batt) = msg.batt_status {
            if batt != 0 {
                self.battery_percent = batt;
            }
        }
        if let Some(temp) = msg.temp_status {
            if temp != 0 {
                self.temperature = temp;
            }
        }
    }
}

fn merge_string(target: &mut String, incoming: Option<&str>) {
    if let Some(value) = incoming {
        if !value.is_empty() {
            *target = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_part_number() {
        assert_eq!(DeviceKind::from_part_number("Nq1"), DeviceKind::Nyquist1);
        assert_eq!(DeviceKind::from_part_number("NQ2-rev3"), DeviceKind::Nyquist2);
        assert_eq!(DeviceKind::from_part_number("nq3"), DeviceKind::Nyquist3);
        assert_eq!(DeviceKind::from_part_number("DQF-2000"), DeviceKind::Nyquist2);
        assert_eq!(DeviceKind::from_part_number("dqf-3000b"), DeviceKind::Nyquist3);
        assert_eq!(DeviceKind::from_part_number("widget"), DeviceKind::Unknown);
    }

    #[test]
    fn test_mac_and_ip_rendering() {
        assert_eq!(
            format_mac(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            "AA-BB-CC-DD-EE-FF"
        );
        assert_eq!(format_mac(&[1, 2, 3]), "");
        assert_eq!(format_ip(&[192, 168, 1, 77]), "192.168.1.77");
        assert_eq!(format_ip(&[10, 0]), "");
    }

    #[test]
    fn test_merge_populates_fields() {
        let mut meta = DeviceMetadata::default();
        meta.merge_from(&DeviceMessage {
            device_pn: Some("Nq1".to_string()),
            device_sn: Some(77_001_234),
            device_fw_rev: Some("1.0.8".to_string()),
            host_name: Some("NQ1-Lab".to_string()),
            device_port: Some(9760),
            ip_addr: Some(vec![192, 168, 1, 77]),
            mac_addr: Some(vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            pwr_status: Some(1),
            ..Default::default()
        });

        assert_eq!(meta.device_kind, DeviceKind::Nyquist1);
        assert_eq!(meta.serial_number, "77001234");
        assert_eq!(meta.device_port, 9760);
        assert_eq!(meta.ip_address, "192.168.1.77");
        assert_eq!(meta.mac_address, "AA-BB-CC-DD-EE-FF");
        assert!(meta.power_on);
    }

    #[test]
    fn test_empty_fields_do_not_overwrite() {
        let mut meta = DeviceMetadata {
            host_name: "NQ1-Lab".to_string(),
            serial_number: "123".to_string(),
            device_port: 9760,
            ..Default::default()
        };
        meta.merge_from(&DeviceMessage {
            host_name: Some(String::new()),
            device_sn: Some(0),
            device_port: Some(0),
            ..Default::default()
        });

        assert_eq!(meta.host_name, "NQ1-Lab");
        assert_eq!(meta.serial_number, "123");
        assert_eq!(meta.device_port, 9760);
    }

    #[test]
    fn test_wrong_length_address_clears_value() {
        let mut meta = DeviceMetadata {
            ip_address: "10.0.0.1".to_string(),
            ..Default::default()
        };
        meta.merge_from(&DeviceMessage {
            ip_addr: Some(vec![1, 2, 3]),
            ..Default::default()
        });
        assert_eq!(meta.ip_address, "");
    }
}
