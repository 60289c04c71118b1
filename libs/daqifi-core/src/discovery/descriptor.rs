//! Discovery result descriptor
//!
//! Compact summary of one discovered device, carrying enough information to
//! open a TCP session to it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::device::metadata::{format_ip, format_mac, DeviceKind};
use crate::wire::DeviceMessage;

/// One discovered device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device host name
    pub name: String,
    /// Serial number as a decimal string
    pub serial_number: String,
    /// Firmware revision
    pub firmware_version: String,
    /// Part number
    pub part_number: String,
    /// IPv4 address the device reported (or answered from)
    pub ip_address: String,
    /// MAC address, hyphen-separated uppercase hex
    pub mac_address: String,
    /// TCP port the data channel listens on
    pub tcp_port: u16,
    /// Local interface address the reply arrived on, when determinable
    pub local_interface_address: Option<Ipv4Addr>,
    /// Whether the measurement subsystem reports power on
    pub power_on: bool,
    /// Device family derived from the part number
    pub device_kind: DeviceKind,
}

impl DeviceDescriptor {
    /// Build a descriptor from a discovery reply
    pub fn from_message(
        msg: &DeviceMessage,
        remote: SocketAddr,
        local_interface_address: Option<Ipv4Addr>,
    ) -> Self {
        let part_number = msg.device_pn.clone().unwrap_or_default();
        let ip_address = msg
            .ip_addr
            .as_deref()
            .map(format_ip)
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| match remote.ip() {
                IpAddr::V4(v4) => v4.to_string(),
                IpAddr::V6(v6) => v6.to_string(),
            });

        Self {
            name: msg.host_name.clone().unwrap_or_default(),
            serial_number: msg
                .device_sn
                .filter(|sn| *sn != 0)
                .map(|sn| sn.to_string())
                .unwrap_or_default(),
            firmware_version: msg.device_fw_rev.clone().unwrap_or_default(),
            device_kind: DeviceKind::from_part_number(&part_number),
            part_number,
            ip_address,
            mac_address: msg.mac_addr.as_deref().map(format_mac).unwrap_or_default(),
            tcp_port: msg.device_port.unwrap_or(0) as u16,
            local_interface_address,
            power_on: msg.pwr_status == Some(1),
        }
    }

    /// Check whether two descriptors identify the same physical device
    ///
    /// MAC addresses win when both sides have one (case-insensitive);
    /// otherwise serial numbers decide.
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        if !self.mac_address.is_empty() && !other.mac_address.is_empty() {
            self.mac_address.eq_ignore_ascii_case(&other.mac_address)
        } else {
            self.serial_number == other.serial_number
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(mac: &str, serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            mac_address: mac.to_string(),
            serial_number: serial.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_prefers_mac() {
        let a = descriptor("AA-BB-CC-DD-EE-FF", "1");
        let b = descriptor("aa-bb-cc-dd-ee-ff", "2");
        assert!(a.same_device(&b));
    }

    #[test]
    fn test_identity_falls_back_to_serial() {
        let a = descriptor("", "42");
        let b = descriptor("AA-BB-CC-DD-EE-FF", "42");
        assert!(a.same_device(&b));
        let c = descriptor("", "43");
        assert!(!a.same_device(&c));
    }

    #[test]
    fn test_from_message_maps_fields() {
        let msg = DeviceMessage {
            host_name: Some("NQ1-Lab".to_string()),
            device_sn: Some(77_001_234),
            device_fw_rev: Some("1.0.8".to_string()),
            device_pn: Some("Nq1".to_string()),
            device_port: Some(9760),
            ip_addr: Some(vec![192, 168, 1, 77]),
            mac_addr: Some(vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            pwr_status: Some(1),
            ..Default::default()
        };
        let remote = SocketAddr::from(([192, 168, 1, 77], 30303));
        let desc = DeviceDescriptor::from_message(&msg, remote, Some(Ipv4Addr::new(192, 168, 1, 10)));

        assert_eq!(desc.name, "NQ1-Lab");
        assert_eq!(desc.serial_number, "77001234");
        assert_eq!(desc.ip_address, "192.168.1.77");
        assert_eq!(desc.mac_address, "AA-BB-CC-DD-EE-FF");
        assert_eq!(desc.tcp_port, 9760);
        assert_eq!(desc.device_kind, DeviceKind::Nyquist1);
        assert!(desc.power_on);
    }

    #[test]
    fn test_from_message_falls_back_to_remote_address() {
        let msg = DeviceMessage::default();
        let remote = SocketAddr::from(([10, 1, 2, 3], 30303));
        let desc = DeviceDescriptor::from_message(&msg, remote, None);
        assert_eq!(desc.ip_address, "10.1.2.3");
        assert!(!desc.power_on);
    }
}
