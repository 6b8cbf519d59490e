//! Wire protocol shared by every transport

pub mod framing;
pub mod handshake;
pub mod message;

pub use framing::{codec, framed, udp_framed};
pub use handshake::{Role, CHECK, CHECK_ACK, HANDSHAKE_TIMEOUT, PROBE_TIMEOUT};
pub use message::{AudioFormat, AudioPacket, UdpMessage};
