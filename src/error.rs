//! Error types for the microphone relay

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffer construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Capacity must be non-zero")]
    ZeroCapacity,

    #[error("Reorder window must be a power of two, got {0}")]
    InvalidWindow(usize),
}

/// Wire format errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Handshake failures
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("Peer answered {0:?}")]
    Mismatch(String),

    #[error("Peer closed the link during handshake")]
    Closed,

    #[error("IO error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No usable network interface")]
    NoNetwork,

    #[error("Peer rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("USB permission denied")]
    PermissionDenied,

    #[error("No target device found")]
    NoTarget,

    #[error("ADB failed: {0}")]
    Adb(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout")]
    Timeout,
}

/// Session orchestration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is already streaming")]
    AlreadyStreaming,

    #[error("Connection to {0} failed")]
    ConnectFailed(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
