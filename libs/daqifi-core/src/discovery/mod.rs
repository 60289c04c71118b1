//! Device discovery
//!
//! Broadcasts a probe datagram on every broadcast-capable interface and
//! collects the length-delimited replies into device descriptors. Replies
//! are deduplicated by MAC address (serial number as fallback); the first
//! descriptor seen for an identity wins.

pub mod descriptor;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use netdev::interface::InterfaceType;
use prost::Message as _;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DaqifiError, Result};
use crate::transport::{UdpTransport, UdpTransportConfig};
use crate::wire::DeviceMessage;

pub use descriptor::DeviceDescriptor;

/// Default discovery port (bind and probe destination)
pub const DISCOVERY_PORT: u16 = 30303;

/// Probe payload the client broadcasts
pub const DISCOVERY_PROBE: &[u8] = b"DAQiFi?\r\n";

/// Alternate probe other tooling broadcasts; never a device reply
const ALTERNATE_PROBE: &[u8] = b"Discovery: Who is out there?\r\n";

/// Unsolicited notification some firmware broadcasts; not a discovery reply
const POWER_EVENT_PREFIX: &[u8] = b"Power event occurred";

/// Inner receive slice so cancellation is honored promptly
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to bind locally and probe remotely (0 binds ephemeral)
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
        }
    }
}

/// Event emitted during a discovery run
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device not seen before in this run answered
    DeviceDiscovered(DeviceDescriptor),
    /// The run finished (deadline, cancellation, or disposal)
    Completed,
}

/// A broadcast-capable interface address
#[derive(Debug, Clone, Copy)]
struct BroadcastTarget {
    local: Ipv4Addr,
    netmask: Ipv4Addr,
    broadcast: Ipv4Addr,
}

impl BroadcastTarget {
    /// Check whether a remote address lies on this interface's subnet
    fn covers(&self, remote: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(self.local) & mask) == (u32::from(remote) & mask)
    }
}

/// Enumerate up, IPv4-capable Ethernet/WiFi interfaces with their directed
/// broadcast addresses
fn broadcast_targets() -> Vec<BroadcastTarget> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| {
            iface.is_up()
                && matches!(
                    iface.if_type,
                    InterfaceType::Ethernet | InterfaceType::Wireless80211
                )
        })
        .flat_map(|iface| {
            iface
                .ipv4
                .iter()
                .map(|net| {
                    let local = net.addr();
                    let netmask = net.netmask();
                    let broadcast =
                        Ipv4Addr::from(u32::from(local) | !u32::from(netmask));
                    BroadcastTarget {
                        local,
                        netmask,
                        broadcast,
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// UDP broadcast discovery service
pub struct DiscoveryService {
    config: DiscoveryConfig,
    events: broadcast::Sender<DiscoveryEvent>,
    gate: Semaphore,
    disposed: AtomicBool,
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

impl DiscoveryService {
    /// Create a discovery service
    pub fn new(config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            events,
            gate: Semaphore::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Run one discovery pass until the deadline or cancellation
    ///
    /// Overlapping calls on the same instance are serialized, not refused.
    /// Per-packet decode failures are skipped, never surfaced.
    pub async fn discover(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceDescriptor>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DaqifiError::Disposed);
        }
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| DaqifiError::Disposed)?;
        // Disposal may have happened while waiting for the permit
        if self.disposed.load(Ordering::Acquire) {
            return Err(DaqifiError::Disposed);
        }

        let targets = broadcast_targets();
        debug!("Probing {} broadcast endpoint(s)", targets.len());

        let mut udp = UdpTransport::new(UdpTransportConfig::new(self.config.port));
        udp.open()?;

        let probe_port = if self.config.port == 0 {
            DISCOVERY_PORT
        } else {
            self.config.port
        };
        if targets.is_empty() {
            // No usable interface: fall back to the limited broadcast
            if let Err(e) = udp.send_broadcast(DISCOVERY_PROBE, probe_port).await {
                warn!("Limited broadcast probe failed: {}", e);
            }
        }
        for target in &targets {
            let endpoint = SocketAddr::from((target.broadcast, probe_port));
            if let Err(e) = udp.send_unicast(DISCOVERY_PROBE, endpoint).await {
                warn!("Probe to {} failed: {}", endpoint, e);
            }
        }

        let mut devices: Vec<DeviceDescriptor> = Vec::new();
        let started = tokio::time::Instant::now();
        while !cancel.is_cancelled() {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let slice = RECEIVE_SLICE.min(remaining);
            let Some((data, remote)) = udp.receive(slice, cancel).await else {
                continue;
            };

            if data == DISCOVERY_PROBE
                || data == ALTERNATE_PROBE
                || data.starts_with(POWER_EVENT_PREFIX)
            {
                debug!("Ignoring probe echo from {}", remote);
                continue;
            }

            let msg = match DeviceMessage::decode_length_delimited(data.as_slice()) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Undecodable discovery reply from {}: {}", remote, e);
                    continue;
                }
            };

            let local_interface_address = match remote.ip() {
                IpAddr::V4(v4) => targets
                    .iter()
                    .find(|t| t.covers(v4))
                    .map(|t| t.local),
                IpAddr::V6(_) => None,
            };

            let descriptor =
                DeviceDescriptor::from_message(&msg, remote, local_interface_address);
            if devices.iter().any(|known| known.same_device(&descriptor)) {
                debug!("Duplicate reply from {} ignored", remote);
                continue;
            }

            info!(
                "Discovered {} ({}) at {}",
                descriptor.name, descriptor.serial_number, descriptor.ip_address
            );
            let _ = self
                .events
                .send(DiscoveryEvent::DeviceDiscovered(descriptor.clone()));
            devices.push(descriptor);
        }

        udp.close();
        let _ = self.events.send(DiscoveryEvent::Completed);
        info!("Discovery completed with {} device(s)", devices.len());
        Ok(devices)
    }

    /// Dispose the service; later discovery calls fail with `Disposed`
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.gate.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_empty_discovery_completes_and_raises_completed_once() {
        let service = DiscoveryService::new(DiscoveryConfig { port: 0 });
        let mut events = service.subscribe();
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let devices = service
            .discover(Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(devices.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut completed = 0;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(50), events.recv()).await {
            if matches!(event, DiscoveryEvent::Completed) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_disposed_service_rejects_discovery() {
        let service = DiscoveryService::new(DiscoveryConfig { port: 0 });
        service.dispose();
        let cancel = CancellationToken::new();
        let result = service.discover(Duration::from_millis(50), &cancel).await;
        assert!(matches!(result, Err(DaqifiError::Disposed)));
    }

    #[tokio::test]
    async fn test_concurrent_discovery_is_serialized() {
        let service = Arc::new(DiscoveryService::new(DiscoveryConfig { port: 0 }));

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                service.discover(Duration::from_millis(150), &cancel).await
            })
        };
        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                service.discover(Duration::from_millis(150), &cancel).await
            })
        };

        // Both runs complete; the second waited for the permit instead of
        // failing
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_mac_yields_one_descriptor() {
        // Fixed local port so the replier knows where to answer
        let port = 47_303;
        let service = DiscoveryService::new(DiscoveryConfig { port });
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            for serial in [1_001u64, 1_002] {
                let reply = DeviceMessage {
                    device_sn: Some(serial),
                    mac_addr: Some(vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
                    device_port: Some(9760),
                    ..Default::default()
                };
                let bytes = reply.encode_length_delimited_to_vec();
                let _ = sock.send_to(&bytes, ("127.0.0.1", port)).await;
            }
        });

        let devices = service
            .discover(Duration::from_millis(600), &cancel)
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mac_address, "AA-BB-CC-DD-EE-FF");
        // First reply wins
        assert_eq!(devices[0].serial_number, "1001");
    }

    #[test]
    fn test_broadcast_target_subnet_match() {
        let target = BroadcastTarget {
            local: Ipv4Addr::new(192, 168, 1, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(192, 168, 1, 255),
        };
        assert!(target.covers(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!target.covers(Ipv4Addr::new(192, 168, 2, 77)));
    }
}
