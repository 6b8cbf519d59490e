//! Application configuration
//!
//! Loaded from a TOML file; every section and field is optional and falls
//! back to the defaults below.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::AudioFormat;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "MIC_RELAY_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub buffer: BufferConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
}

/// Link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the receiver binds to; unset picks the machine's LAN address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,
    /// First port tried (TCP, ADB and UDP)
    pub port: u16,
    /// Last port tried when scanning for a free port
    pub max_port: u16,
    /// UDP ports probed when the sender has no explicit port
    pub udp_port_scan: u16,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// How long an acceptor waits for a client; unset waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_timeout_ms: Option<u64>,
    /// Datagrams the UDP receiver holds for reordering, power of two
    pub reorder_window: usize,
    /// How long a USB connect waits for the user to grant access
    pub usb_permission_timeout_ms: u64,
    /// Refuse Wi-Fi connects when no usable interface is up
    pub require_network: bool,
    pub bluetooth_service: Uuid,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: DEFAULT_PORT,
            max_port: MAX_PORT,
            udp_port_scan: UDP_PORT_SCAN,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: CONNECT_TIMEOUT_MS,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            accept_timeout_ms: None,
            reorder_window: REORDER_WINDOW,
            usb_permission_timeout_ms: 30_000,
            require_network: true,
            bluetooth_service: BLUETOOTH_SERVICE_UUID,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }

    pub fn usb_permission_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_permission_timeout_ms)
    }

    /// Candidate UDP ports, in probing order
    pub fn udp_candidate_ports(&self) -> impl Iterator<Item = u16> {
        let last = self
            .port
            .saturating_add(self.udp_port_scan.saturating_sub(1))
            .min(self.max_port);
        self.port..=last
    }
}

/// Buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    pub chunk_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: BUFFER_CAPACITY,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Streaming task behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stop_timeout_ms: u64,
    pub idle_interval_us: u64,
    /// Events kept for a slow observer before new ones are dropped
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: STOP_TIMEOUT_MS,
            idle_interval_us: IDLE_INTERVAL_US,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_micros(self.idle_interval_us)
    }
}

/// Format stamped on outgoing packets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub audio_format: AudioFormat,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channel_count: 1,
            audio_format: AudioFormat::I16,
        }
    }
}

impl AppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load `path`, else the per-user config file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load the file named by `MIC_RELAY_CONFIG`, falling back like
    /// [`AppConfig::load_or_default`]
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_or_default(path.as_deref())
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Per-user config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "AndroidMic", "mic-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer.capacity == 0 {
            return Err(Error::Config("buffer.capacity must be non-zero".into()));
        }
        if self.buffer.chunk_size == 0 {
            return Err(Error::Config("buffer.chunk_size must be non-zero".into()));
        }
        if self.network.reorder_window < 2 || !self.network.reorder_window.is_power_of_two() {
            return Err(Error::Config(format!(
                "network.reorder_window must be a power of two, got {}",
                self.network.reorder_window
            )));
        }
        if self.network.udp_port_scan == 0 {
            return Err(Error::Config("network.udp_port_scan must be at least 1".into()));
        }
        if self.network.port > self.network.max_port {
            return Err(Error::Config(format!(
                "network.port {} is above network.max_port {}",
                self.network.port, self.network.max_port
            )));
        }
        if self.audio.channel_count == 0 {
            return Err(Error::Config("audio.channel_count must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.buffer.capacity, 5120);
        assert_eq!(config.buffer.chunk_size, 1024);
        assert_eq!(config.network.port, 55555);
        assert_eq!(config.network.bind_address, None);
        assert_eq!(config.network.connect_timeout(), Duration::from_millis(1500));
        assert_eq!(config.network.probe_timeout(), Duration::from_millis(100));
        assert_eq!(
            config.network.bluetooth_service.to_string(),
            "34335e34-bccf-11eb-8529-0242ac130003"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [network]
            port = 6000
            bind_address = "192.168.1.10"
            accept_timeout_ms = 250

            [audio]
            audio_format = "f32"
            channel_count = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.network.port, 6000);
        assert_eq!(config.network.bind_address, Some("192.168.1.10".parse().unwrap()));
        assert_eq!(config.network.accept_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.network.udp_port_scan, 16);
        assert_eq!(config.audio.audio_format, AudioFormat::F32);
        assert_eq!(config.buffer.capacity, 5120);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml_str("[buffer]\ncapacity = 0").is_err());
        assert!(AppConfig::from_toml_str("[network]\nreorder_window = 48").is_err());
        assert!(AppConfig::from_toml_str("[network]\nport = 61000").is_err());
        assert!(AppConfig::from_toml_str("not toml at all [").is_err());
    }

    #[test]
    fn test_udp_candidates_stop_at_max_port() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.udp_candidate_ports().count(), 16);

        network.port = 59_998;
        assert_eq!(
            network.udp_candidate_ports().collect::<Vec<_>>(),
            vec![59_998, 59_999, 60_000]
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("mic-relay-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.session.stop_timeout_ms = 700;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.session.stop_timeout_ms, 700);
        assert_eq!(loaded.network.accept_timeout_ms, None);
        assert_eq!(loaded.network.bind_address, None);

        std::fs::remove_dir_all(dir).ok();
    }
}
