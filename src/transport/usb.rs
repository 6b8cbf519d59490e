//! USB accessory transport
//!
//! Opening an accessory needs the user's consent, which the platform
//! reports asynchronously. The transport waits on a [`watch`] channel for
//! the decision, then opens the accessory stream and runs the handshake
//! over it.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::link::StreamLink;
use super::{BoxedStream, Connection, ConnectionState};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::protocol::Role;

/// Permission state of the accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbPermission {
    Pending,
    Granted,
    Denied,
}

/// Platform accessory handle
#[async_trait]
pub trait AccessoryPort: Send + Sync {
    /// Human-readable accessory name
    fn describe(&self) -> String;

    /// Open the accessory as a byte stream
    async fn open(&self) -> io::Result<BoxedStream>;
}

/// Accessory exposed as a device node
#[derive(Debug, Clone)]
pub struct FileAccessory {
    path: PathBuf,
}

impl FileAccessory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AccessoryPort for FileAccessory {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn open(&self) -> io::Result<BoxedStream> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        Ok(Box::new(file))
    }
}

/// Wait until the permission leaves `Pending`
pub async fn wait_for_permission(
    permission: &mut watch::Receiver<UsbPermission>,
    limit: Duration,
) -> Result<(), NetworkError> {
    let decided = timeout(limit, permission.wait_for(|p| *p != UsbPermission::Pending))
        .await
        .map_err(|_| NetworkError::Timeout)?;

    match decided.map(|p| *p) {
        Ok(UsbPermission::Granted) => Ok(()),
        // a dropped sender can never grant access
        Ok(_) | Err(_) => Err(NetworkError::PermissionDenied),
    }
}

/// Accessory link
pub struct UsbTransport {
    port: Arc<dyn AccessoryPort>,
    permission: watch::Receiver<UsbPermission>,
    permission_timeout: Duration,
    handshake_timeout: Duration,
    link: Option<StreamLink<BoxedStream>>,
    state: ConnectionState,
}

impl UsbTransport {
    pub fn new(
        port: Arc<dyn AccessoryPort>,
        permission: watch::Receiver<UsbPermission>,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            port,
            permission,
            permission_timeout: config.usb_permission_timeout(),
            handshake_timeout: config.handshake_timeout(),
            link: None,
            state: ConnectionState::Disconnected,
        }
    }

    async fn open(&mut self) -> Result<StreamLink<BoxedStream>, NetworkError> {
        debug!("Waiting for USB permission");
        wait_for_permission(&mut self.permission, self.permission_timeout).await?;

        let stream = self
            .port
            .open()
            .await
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        let link =
            StreamLink::establish(stream, Role::Initiator, self.handshake_timeout, self.port.describe())
                .await?;
        Ok(link)
    }
}

impl Connection for UsbTransport {
    async fn connect(&mut self) -> bool {
        if self.link.is_some() {
            return true;
        }

        self.state = ConnectionState::Connecting;
        match self.open().await {
            Ok(link) => {
                info!("USB accessory {} connected", link.peer());
                self.link = Some(link);
                self.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                warn!("USB connect to {} failed: {}", self.port.describe(), e);
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
                info!("USB accessory {} disconnected", link.peer());
                true
            }
            None => false,
        }
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError> {
        let link = self.link.as_mut().ok_or(NetworkError::NotConnected)?;
        if let Err(e) = link.send(chunk).await {
            warn!("USB send failed: {}", e);
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    async fn recv_chunk(&mut self) -> Result<Option<Bytes>, NetworkError> {
        let link = self.link.as_mut().ok_or(NetworkError::NotConnected)?;
        match link.recv().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.disconnect().await;
                Ok(None)
            }
            Err(e) => {
                warn!("USB receive failed: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.link.is_some()
    }

    fn info(&self) -> String {
        self.port.describe()
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permission_granted_later() {
        let (tx, mut rx) = watch::channel(UsbPermission::Pending);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(UsbPermission::Granted).ok();
        });

        wait_for_permission(&mut rx, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let (_tx, mut rx) = watch::channel(UsbPermission::Denied);
        assert!(matches!(
            wait_for_permission(&mut rx, Duration::from_secs(1)).await,
            Err(NetworkError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_permission_never_answered() {
        let (_tx, mut rx) = watch::channel(UsbPermission::Pending);
        assert!(matches!(
            wait_for_permission(&mut rx, Duration::from_millis(20)).await,
            Err(NetworkError::Timeout)
        ));

        let (tx, mut rx) = watch::channel(UsbPermission::Pending);
        drop(tx);
        assert!(matches!(
            wait_for_permission(&mut rx, Duration::from_millis(20)).await,
            Err(NetworkError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_missing_device_node_fails_connect() {
        let (_tx, rx) = watch::channel(UsbPermission::Granted);
        let port = Arc::new(FileAccessory::new("/nonexistent/usb_accessory"));
        let mut transport = UsbTransport::new(port, rx, &NetworkConfig::default());

        assert!(!transport.connect().await);
        assert_eq!(transport.info(), "/nonexistent/usb_accessory");
    }
}
