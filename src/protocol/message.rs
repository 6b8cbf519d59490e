//! Serialized message types
//!
//! Payloads are encoded with bincode (fixed-width integers, big endian,
//! bounded by the frame limit) so a hostile length field cannot force a
//! large allocation.

use bincode::Options;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::constants::MAX_FRAME_LEN;
use crate::error::ProtocolError;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_FRAME_LEN as u64)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(codec().serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(codec().deserialize(bytes)?)
}

/// PCM sample encoding carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    U8,
    #[default]
    I16,
    I24,
    I32,
    F32,
}

impl AudioFormat {
    /// Bytes per sample
    pub fn sample_size(self) -> usize {
        match self {
            AudioFormat::U8 => 1,
            AudioFormat::I16 => 2,
            AudioFormat::I24 => 3,
            AudioFormat::I32 | AudioFormat::F32 => 4,
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" => Ok(AudioFormat::U8),
            "i16" => Ok(AudioFormat::I16),
            "i24" => Ok(AudioFormat::I24),
            "i32" => Ok(AudioFormat::I32),
            "f32" => Ok(AudioFormat::F32),
            other => Err(format!("unknown audio format: {other}")),
        }
    }
}

/// One chunk of captured audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPacket {
    pub buffer: Vec<u8>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub audio_format: AudioFormat,
}

impl AudioPacket {
    /// Bytes in one interleaved sample frame
    pub fn frame_size(&self) -> usize {
        self.audio_format.sample_size() * usize::from(self.channel_count.max(1))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Datagram body on the UDP link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UdpMessage {
    /// Simulated connect from the sender
    Connect,
    /// Echo confirming a `Connect`
    ConnectAck,
    /// Sequence-numbered payload
    Data { sequence: u32, payload: Vec<u8> },
}

impl UdpMessage {
    /// Body of one datagram, before framing
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(encode(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_follows_format() {
        let packet = AudioPacket {
            buffer: vec![],
            sample_rate: 48000,
            channel_count: 2,
            audio_format: AudioFormat::I24,
        };
        assert_eq!(packet.frame_size(), 6);
    }

    #[test]
    fn test_audio_format_parsing() {
        assert_eq!("F32".parse::<AudioFormat>().unwrap(), AudioFormat::F32);
        assert!("i48".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn test_data_message_layout() {
        let body = UdpMessage::Data {
            sequence: 7,
            payload: vec![0xAA, 0xBB],
        }
        .encode()
        .unwrap();

        // variant index, sequence, payload length, payload
        assert_eq!(&body[..4], &[0, 0, 0, 2]);
        assert_eq!(&body[4..8], &[0, 0, 0, 7]);
        assert_eq!(&body[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&body[16..], &[0xAA, 0xBB]);

        assert_eq!(
            UdpMessage::decode(&body).unwrap(),
            UdpMessage::Data {
                sequence: 7,
                payload: vec![0xAA, 0xBB]
            }
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(UdpMessage::decode(&[9, 9, 9, 9]).is_err());
        assert!(AudioPacket::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_hostile_length_does_not_allocate() {
        // claims a u64::MAX-sized buffer
        let mut bytes = vec![0xff; 8];
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(AudioPacket::decode(&bytes).is_err());
    }
}
