//! Bluetooth RFCOMM transport
//!
//! The platform side (paired-device list, RFCOMM sockets, disconnect
//! broadcasts) sits behind [`BluetoothAdapter`] and [`LinkMonitor`].
//! When no target has been chosen yet, connecting probes every paired
//! computer and keeps the first one that answers the handshake.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use super::link::StreamLink;
use super::{BoxedStream, Connection, ConnectionState};
use crate::config::NetworkConfig;
use crate::discovery;
use crate::error::NetworkError;
use crate::protocol::Role;

/// Major device class reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    Computer,
    Phone,
    Audio,
    Other,
}

/// Paired remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub name: String,
    pub address: String,
    pub class: DeviceClass,
}

impl BluetoothDevice {
    pub fn is_computer(&self) -> bool {
        self.class == DeviceClass::Computer
    }
}

/// Platform Bluetooth stack
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// Devices bonded with this adapter
    async fn paired_devices(&self) -> io::Result<Vec<BluetoothDevice>>;

    /// Open an RFCOMM stream to `service` on `device`
    async fn open_rfcomm(&self, device: &BluetoothDevice, service: Uuid) -> io::Result<BoxedStream>;
}

/// Target chosen by discovery, kept across connection attempts
pub type SharedTarget = Arc<Mutex<Option<BluetoothDevice>>>;

/// Disconnect notifications from the platform
///
/// The platform's broadcast receiver calls [`LinkMonitor::notify_disconnected`];
/// the transport checks [`LinkMonitor::is_linked`] before every transfer.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    linked: Arc<AtomicBool>,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self {
            linked: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The ACL link to the target dropped
    pub fn notify_disconnected(&self) {
        self.linked.store(false, Ordering::SeqCst);
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.linked.store(true, Ordering::SeqCst);
    }
}

/// RFCOMM link
pub struct BluetoothTransport {
    adapter: Arc<dyn BluetoothAdapter>,
    target: SharedTarget,
    monitor: LinkMonitor,
    service: Uuid,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    probe_timeout: Duration,
    link: Option<StreamLink<BoxedStream>>,
    state: ConnectionState,
}

impl BluetoothTransport {
    pub fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        target: SharedTarget,
        monitor: LinkMonitor,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            adapter,
            target,
            monitor,
            service: config.bluetooth_service,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            probe_timeout: config.probe_timeout(),
            link: None,
            state: ConnectionState::Disconnected,
        }
    }

    async fn open(&self) -> Result<(BluetoothDevice, StreamLink<BoxedStream>), NetworkError> {
        let known = self.target.lock().clone();
        let Some(device) = known else {
            return discovery::probe_bluetooth(
                self.adapter.as_ref(),
                self.service,
                self.connect_timeout,
                self.probe_timeout,
            )
            .await
            .ok_or(NetworkError::NoTarget);
        };

        let stream = timeout(self.connect_timeout, self.adapter.open_rfcomm(&device, self.service))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        let peer = device.address.clone();
        let link = StreamLink::establish(stream, Role::Initiator, self.handshake_timeout, peer).await?;
        Ok((device, link))
    }

    async fn ensure_linked(&mut self) -> Result<(), NetworkError> {
        if self.link.is_some() && !self.monitor.is_linked() {
            warn!("Bluetooth link dropped by the platform");
            self.disconnect().await;
            return Err(NetworkError::NotConnected);
        }
        Ok(())
    }
}

impl Connection for BluetoothTransport {
    async fn connect(&mut self) -> bool {
        if self.is_alive() {
            return true;
        }

        self.state = ConnectionState::Connecting;
        match self.open().await {
            Ok((device, link)) => {
                info!("Bluetooth connected to {} ({})", device.name, device.address);
                *self.target.lock() = Some(device);
                self.monitor.reset();
                self.link = Some(link);
                self.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                warn!("Bluetooth connect failed: {}", e);
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    async fn disconnect(&mut self) -> bool {
        self.state = ConnectionState::Disconnected;
        match self.link.take() {
            Some(mut link) => {
                link.close().await;
                info!("Bluetooth disconnected from {}", link.peer());
                true
            }
            None => false,
        }
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError> {
        self.ensure_linked().await?;
        let link = self.link.as_mut().ok_or(NetworkError::NotConnected)?;
        if let Err(e) = link.send(chunk).await {
            warn!("Bluetooth send failed: {}", e);
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    async fn recv_chunk(&mut self) -> Result<Option<Bytes>, NetworkError> {
        self.ensure_linked().await?;
        let link = self.link.as_mut().ok_or(NetworkError::NotConnected)?;
        match link.recv().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.disconnect().await;
                Ok(None)
            }
            Err(e) => {
                warn!("Bluetooth receive failed: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.link.is_some() && self.monitor.is_linked()
    }

    fn info(&self) -> String {
        match self.target.lock().as_ref() {
            Some(device) => format!("{} ({})", device.name, device.address),
            None => "no target selected".to_string(),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
