//! Peer selection and network checks
//!
//! Bluetooth targets are found by probing every paired computer with the
//! handshake. Wi-Fi mode needs a local interface that can actually reach
//! the PC; [`NetworkCheck`] implementations decide that before a socket is
//! opened.

use serde::{Deserialize, Serialize};
use std::io;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NetworkError;
use crate::protocol::Role;
use crate::transport::{BluetoothAdapter, BluetoothDevice, BoxedStream, StreamLink};

/// Probe paired computers until one answers the handshake
///
/// Returns the device together with its already validated link. Failed
/// candidates are skipped without retry.
pub async fn probe_bluetooth(
    adapter: &dyn BluetoothAdapter,
    service: Uuid,
    connect_timeout: Duration,
    probe_timeout: Duration,
) -> Option<(BluetoothDevice, StreamLink<BoxedStream>)> {
    let devices = match adapter.paired_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Failed to list paired devices: {}", e);
            return None;
        }
    };

    for device in devices.into_iter().filter(BluetoothDevice::is_computer) {
        debug!("Probing {} ({})", device.name, device.address);

        let stream = match timeout(connect_timeout, adapter.open_rfcomm(&device, service)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("{} refused RFCOMM: {}", device.address, e);
                continue;
            }
            Err(_) => {
                debug!("{} did not open RFCOMM in time", device.address);
                continue;
            }
        };

        let peer = device.address.clone();
        match StreamLink::establish(stream, Role::Initiator, probe_timeout, peer).await {
            Ok(link) => {
                info!("Selected {} ({}) as target", device.name, device.address);
                return Some((device, link));
            }
            Err(e) => debug!("{} failed the handshake: {}", device.address, e),
        }
    }
    None
}

/// Probe paired computers and return the first that answers
pub async fn select_bluetooth_target(
    adapter: &dyn BluetoothAdapter,
    service: Uuid,
    connect_timeout: Duration,
    probe_timeout: Duration,
) -> Option<BluetoothDevice> {
    let (device, mut link) = probe_bluetooth(adapter, service, connect_timeout, probe_timeout).await?;
    link.close().await;
    Some(device)
}

/// Interface family, as far as streaming cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Ethernet,
    Wireless,
    UsbTethering,
    Loopback,
    Other,
}

impl InterfaceKind {
    /// Infer the kind from an interface name (Android, Linux, macOS or
    /// Windows friendly names)
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "lo" | "lo0" => InterfaceKind::Loopback,
            "rndis0" | "ap0" => InterfaceKind::UsbTethering,
            n if n.starts_with("loopback") => InterfaceKind::Loopback,
            n if n.starts_with("wlan") || n.starts_with("wlp") || n.starts_with("wi-fi") => {
                InterfaceKind::Wireless
            }
            n if n.starts_with("eth") || n.starts_with("en") => InterfaceKind::Ethernet,
            _ => InterfaceKind::Other,
        }
    }

    pub fn can_stream(self) -> bool {
        matches!(
            self,
            InterfaceKind::Ethernet | InterfaceKind::Wireless | InterfaceKind::UsbTethering
        )
    }
}

/// One network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub kind: InterfaceKind,
    pub is_up: bool,
    pub addresses: Vec<IpAddr>,
}

impl InterfaceInfo {
    /// Interface with its kind inferred from the name
    pub fn named(name: impl Into<String>, is_up: bool, addresses: Vec<IpAddr>) -> Self {
        let name = name.into();
        Self {
            kind: InterfaceKind::from_name(&name),
            name,
            is_up,
            addresses,
        }
    }
}

/// Local address the link could be served from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCandidate {
    pub interface: String,
    pub kind: InterfaceKind,
    pub address: Ipv4Addr,
}

/// Every IPv4, non-loopback address on an up, streamable interface
///
/// Several candidates are all returned; choosing between them is left to
/// the caller.
pub fn usable_addresses(interfaces: &[InterfaceInfo]) -> Vec<NetworkCandidate> {
    interfaces
        .iter()
        .filter(|iface| iface.is_up && iface.kind.can_stream())
        .flat_map(|iface| {
            iface.addresses.iter().filter_map(move |address| match address {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(NetworkCandidate {
                    interface: iface.name.clone(),
                    kind: iface.kind,
                    address: *v4,
                }),
                _ => None,
            })
        })
        .collect()
}

/// Source of the local interface list
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> io::Result<Vec<InterfaceInfo>>;
}

/// Fixed interface list, for callers that enumerate interfaces themselves
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<InterfaceInfo>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceInfo>> {
        Ok(self.0.clone())
    }
}

/// Interfaces as the operating system reports them
///
/// Only interfaces holding an address are listed, so every one of them
/// counts as up.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceInfo>> {
        let addresses = local_ip_address::list_afinet_netifas()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(group_by_interface(addresses))
    }
}

/// Fold `(name, address)` pairs into one entry per interface
fn group_by_interface(addresses: Vec<(String, IpAddr)>) -> Vec<InterfaceInfo> {
    let mut grouped: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
    for (name, address) in addresses {
        grouped.entry(name).or_default().push(address);
    }
    grouped
        .into_iter()
        .map(|(name, addresses)| InterfaceInfo::named(name, true, addresses))
        .collect()
}

/// Address a receiver binds to when none is configured
pub fn local_address() -> Result<IpAddr, NetworkError> {
    local_ip_address::local_ip().map_err(|e| {
        debug!("No local address: {}", e);
        NetworkError::NoNetwork
    })
}

/// Precondition for dialing a peer over the network
pub trait NetworkCheck: Send + Sync {
    fn is_usable(&self, peer: IpAddr) -> bool;
}

/// Usable when at least one interface offers a candidate address
pub struct InterfaceCheck<S> {
    source: S,
}

impl<S: InterfaceSource> InterfaceCheck<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn candidates(&self) -> Vec<NetworkCandidate> {
        match self.source.interfaces() {
            Ok(interfaces) => usable_addresses(&interfaces),
            Err(e) => {
                warn!("Failed to list network interfaces: {}", e);
                Vec::new()
            }
        }
    }
}

impl<S: InterfaceSource> NetworkCheck for InterfaceCheck<S> {
    fn is_usable(&self, _peer: IpAddr) -> bool {
        !self.candidates().is_empty()
    }
}
