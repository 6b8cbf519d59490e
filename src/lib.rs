//! # mic-relay
//!
//! Forwards a phone microphone to a PC over whatever link is available.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── SENDER ─────────────────────────────┐
//! │  capture thread ──push──▶ RegionBuffer ──read region──┐         │
//! │                           (5120 bytes)                │         │
//! │                                                       ▼         │
//! │              StreamSession drain task ──▶ Transport::send_chunk │
//! │                                          [len|AudioPacket]      │
//! └──────────────────────────────────────────┬──────────────────────┘
//!                 TCP / ADB / UDP / RFCOMM / USB accessory
//! ┌──────────────────────────────────────────┴──────────────────────┐
//! │   Transport::recv_chunk ──▶ StreamSession fill task             │
//! │                                   │ write region                │
//! │                                   ▼                             │
//! │                            RegionBuffer ──pop──▶ player         │
//! └──────────────────────────── RECEIVER ───────────────────────────┘
//! ```
//!
//! Every link starts with the `AndroidMicCheck` / `AndroidMicCheckAck`
//! exchange (see [`protocol::handshake`]) before any audio moves.

pub mod buffer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Region buffer capacity in bytes
    pub const BUFFER_CAPACITY: usize = 5 * 1024;

    /// Bytes moved per drain iteration
    pub const CHUNK_SIZE: usize = 1024;

    /// Default TCP / UDP port on the PC
    pub const DEFAULT_PORT: u16 = 55555;

    /// Highest port tried when scanning for a free or answering port
    pub const MAX_PORT: u16 = 60000;

    /// Number of UDP ports probed when no port is configured
    pub const UDP_PORT_SCAN: u16 = 16;

    /// Connect and handshake timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 1500;

    /// Handshake timeout used while scanning many candidates
    pub const PROBE_TIMEOUT_MS: u64 = 100;

    /// Best-effort wait for the streaming task on stop
    pub const STOP_TIMEOUT_MS: u64 = 1000;

    /// Pause between loop iterations when there is nothing to move
    pub const IDLE_INTERVAL_US: u64 = 500;

    /// RFCOMM service record shared by both ends
    pub const BLUETOOTH_SERVICE_UUID: uuid::Uuid =
        uuid::Uuid::from_u128(0x34335e34_bccf_11eb_8529_0242ac130003);

    /// Largest frame accepted from the wire
    pub const MAX_FRAME_LEN: usize = 1 << 20;

    /// Reorder window (in datagrams) for the UDP receiver
    pub const REORDER_WINDOW: usize = 64;
}
