//! `adb reverse` tunnel for the receiver
//!
//! In ADB mode the PC listens on loopback and asks the ADB server to
//! forward `tcp:<port>` on the phone to it, so the phone dials its own
//! `127.0.0.1`. The adb client is blocking and runs on the blocking pool.

use adb_client::ADBServer;
use tracing::{info, warn};

use crate::error::NetworkError;

/// Active reverse forward, removed again by [`AdbReverse::stop`]
#[derive(Debug)]
pub struct AdbReverse {
    remote: String,
    local: String,
}

impl AdbReverse {
    /// Forward the phone's `remote_port` to `local_port` on this machine
    ///
    /// Any reverse forward left behind by an earlier run is removed first.
    pub async fn start(remote_port: u16, local_port: u16) -> Result<Self, NetworkError> {
        let tunnel = Self {
            remote: tcp_spec(remote_port),
            local: tcp_spec(local_port),
        };

        let (remote, local) = (tunnel.remote.clone(), tunnel.local.clone());
        run_blocking(move || {
            let mut server = ADBServer::default();
            let mut device = server.get_device().map_err(adb_error)?;
            device.reverse_remove_all().map_err(adb_error)?;
            device.reverse(remote, local).map_err(adb_error)
        })
        .await?;

        info!("ADB reverse {} -> {}", tunnel.remote, tunnel.local);
        Ok(tunnel)
    }

    /// Remove the forward from the device
    pub async fn stop(self) -> Result<(), NetworkError> {
        let result = run_blocking(|| {
            let mut server = ADBServer::default();
            let mut device = server.get_device().map_err(adb_error)?;
            device.reverse_remove_all().map_err(adb_error)
        })
        .await;

        match &result {
            Ok(()) => info!("ADB reverse {} removed", self.remote),
            Err(e) => warn!("Failed to remove ADB reverse {}: {}", self.remote, e),
        }
        result
    }

    /// Port spec on the phone, e.g. `tcp:55555`
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Port spec on this machine
    pub fn local(&self) -> &str {
        &self.local
    }
}

fn tcp_spec(port: u16) -> String {
    format!("tcp:{port}")
}

fn adb_error(e: impl std::fmt::Display) -> NetworkError {
    NetworkError::Adb(e.to_string())
}

async fn run_blocking<F>(f: F) -> Result<(), NetworkError>
where
    F: FnOnce() -> Result<(), NetworkError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NetworkError::Adb(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_spec() {
        assert_eq!(tcp_spec(55555), "tcp:55555");
        assert_eq!(tcp_spec(6000), "tcp:6000");
    }

    #[test]
    fn test_adb_errors_keep_message() {
        let error = adb_error("no devices/emulators found");
        assert!(matches!(&error, NetworkError::Adb(msg) if msg == "no devices/emulators found"));
        assert_eq!(error.to_string(), "ADB failed: no devices/emulators found");
    }
}
