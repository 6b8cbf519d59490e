//! Transport connections
//!
//! Every link type (TCP, ADB-forwarded TCP, Bluetooth RFCOMM, UDP, USB
//! accessory) is a [`Transport`] variant behind the same [`Connection`]
//! contract:
//! `connect` validates the peer and reports success as a bool,
//! `send_chunk`/`recv_chunk` move one frame and drop the link on failure,
//! and `disconnect` is idempotent. A fresh transport is built from a
//! [`ConnectOption`] for every connection attempt.

pub mod adb;
pub mod bluetooth;
pub mod link;
pub mod tcp;
pub mod udp;
pub mod usb;

use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::config::NetworkConfig;
use crate::discovery::{InterfaceCheck, NetworkCheck, SystemInterfaces};
use crate::error::NetworkError;

pub use adb::AdbReverse;
pub use bluetooth::{
    BluetoothAdapter, BluetoothDevice, BluetoothTransport, DeviceClass, LinkMonitor, SharedTarget,
};
pub use link::StreamLink;
pub use tcp::{bind_listener, TcpTransport};
pub use udp::{bind_acceptor, create_socket, UdpTransport};
pub use usb::{AccessoryPort, FileAccessory, UsbPermission, UsbTransport};

/// Byte stream usable as a link
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Stream handed out by platform adapters
pub type BoxedStream = Box<dyn AsyncStream>;

/// Link family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Bluetooth,
    Udp,
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Udp => "udp",
            TransportKind::Usb => "usb",
        };
        f.write_str(name)
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Contract shared by every link type
#[enum_dispatch]
#[allow(async_fn_in_trait)]
pub trait Connection {
    /// Open the link and validate the peer
    async fn connect(&mut self) -> bool;

    /// Close the link; false if it was not connected
    async fn disconnect(&mut self) -> bool;

    /// Send one frame
    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError>;

    /// Receive one frame; `None` when the peer ended the stream
    async fn recv_chunk(&mut self) -> Result<Option<Bytes>, NetworkError>;

    fn is_alive(&self) -> bool;

    /// Endpoint description
    fn info(&self) -> String;

    fn state(&self) -> ConnectionState;
}

/// One connection of any kind
#[enum_dispatch(Connection)]
pub enum Transport {
    Tcp(TcpTransport),
    Bluetooth(BluetoothTransport),
    Udp(UdpTransport),
    Usb(UsbTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Tcp(_) => TransportKind::Tcp,
            Transport::Bluetooth(_) => TransportKind::Bluetooth,
            Transport::Udp(_) => TransportKind::Udp,
            Transport::Usb(_) => TransportKind::Usb,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("endpoint", &self.info())
            .field("state", &self.state())
            .finish()
    }
}

/// How a session reaches its peer
#[derive(Clone)]
pub enum ConnectOption {
    /// Dial a PC over Wi-Fi or Ethernet
    Tcp { addr: SocketAddr },
    /// Dial through an `adb reverse` tunnel on loopback
    Adb { port: u16 },
    /// Wait for a phone on a bound listener
    TcpListen { listener: Arc<TcpListener> },
    /// Send datagrams; without a port the candidate range is probed
    Udp { ip: IpAddr, port: Option<u16> },
    /// Wait for a phone on a bound socket
    UdpListen { socket: Arc<UdpSocket> },
    Bluetooth {
        adapter: Arc<dyn BluetoothAdapter>,
        target: SharedTarget,
        monitor: LinkMonitor,
    },
    Usb {
        port: Arc<dyn AccessoryPort>,
        permission: watch::Receiver<UsbPermission>,
    },
}

impl ConnectOption {
    /// Build a fresh, unconnected transport
    pub fn build(&self, config: &NetworkConfig) -> Transport {
        let network_check = || -> Option<Arc<dyn NetworkCheck>> {
            config
                .require_network
                .then(|| Arc::new(InterfaceCheck::new(SystemInterfaces)) as Arc<dyn NetworkCheck>)
        };

        match self {
            ConnectOption::Tcp { addr } => {
                Transport::Tcp(TcpTransport::dial(*addr, config).with_network_check(network_check()))
            }
            ConnectOption::Adb { port } => Transport::Tcp(TcpTransport::adb(*port, config)),
            ConnectOption::TcpListen { listener } => {
                Transport::Tcp(TcpTransport::accept_on(listener.clone(), config))
            }
            ConnectOption::Udp { ip, port } => Transport::Udp(
                UdpTransport::dial(*ip, *port, config).with_network_check(network_check()),
            ),
            ConnectOption::UdpListen { socket } => {
                Transport::Udp(UdpTransport::accept_on(socket.clone(), config))
            }
            ConnectOption::Bluetooth {
                adapter,
                target,
                monitor,
            } => Transport::Bluetooth(BluetoothTransport::new(
                adapter.clone(),
                target.clone(),
                monitor.clone(),
                config,
            )),
            ConnectOption::Usb { port, permission } => Transport::Usb(UsbTransport::new(
                port.clone(),
                permission.clone(),
                config,
            )),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectOption::Tcp { .. } | ConnectOption::Adb { .. } | ConnectOption::TcpListen { .. } => {
                TransportKind::Tcp
            }
            ConnectOption::Udp { .. } | ConnectOption::UdpListen { .. } => TransportKind::Udp,
            ConnectOption::Bluetooth { .. } => TransportKind::Bluetooth,
            ConnectOption::Usb { .. } => TransportKind::Usb,
        }
    }
}

impl fmt::Debug for ConnectOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOption::Tcp { addr } => write!(f, "Tcp({addr})"),
            ConnectOption::Adb { port } => write!(f, "Adb({})", SocketAddr::from((Ipv4Addr::LOCALHOST, *port))),
            ConnectOption::TcpListen { listener } => match listener.local_addr() {
                Ok(addr) => write!(f, "TcpListen({addr})"),
                Err(_) => f.write_str("TcpListen"),
            },
            ConnectOption::Udp { ip, port: Some(port) } => write!(f, "Udp({ip}:{port})"),
            ConnectOption::Udp { ip, port: None } => write!(f, "Udp({ip}:scan)"),
            ConnectOption::UdpListen { socket } => match socket.local_addr() {
                Ok(addr) => write!(f, "UdpListen({addr})"),
                Err(_) => f.write_str("UdpListen"),
            },
            ConnectOption::Bluetooth { target, .. } => match target.lock().as_ref() {
                Some(device) => write!(f, "Bluetooth({})", device.address),
                None => f.write_str("Bluetooth(unselected)"),
            },
            ConnectOption::Usb { port, .. } => write!(f, "Usb({})", port.describe()),
        }
    }
}
