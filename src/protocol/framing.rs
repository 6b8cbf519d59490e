//! Length-prefixed framing
//!
//! Every message on every link is `[u32 big-endian length][payload]`.
//! Stream links run through [`Framed`]; datagram links carry exactly one
//! frame per datagram through [`UdpFramed`].

use std::borrow::Borrow;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::udp::UdpFramed;

use crate::constants::MAX_FRAME_LEN;

/// Size of the length header
pub const HEADER_LEN: usize = 4;

/// Codec for the wire framing; frames over 1 MiB are rejected
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(HEADER_LEN)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Frame a byte stream
pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Framed<S, LengthDelimitedCodec> {
    Framed::new(stream, codec())
}

/// Frame a datagram socket
pub fn udp_framed<T: Borrow<UdpSocket>>(socket: T) -> UdpFramed<LengthDelimitedCodec, T> {
    UdpFramed::new(socket, codec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_header_is_big_endian_length() {
        let mut frame = BytesMut::new();
        codec().encode(Bytes::from_static(b"abc"), &mut frame).unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let mut frame = BytesMut::new();
        let huge = Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]);
        assert!(codec().encode(huge, &mut frame).is_err());

        let mut header = BytesMut::from(&[0xff, 0xff, 0xff, 0xff][..]);
        assert!(codec().decode(&mut header).is_err());
    }

    #[tokio::test]
    async fn test_stream_frames_survive_split_reads() {
        let (client, server) = tokio::io::duplex(3);
        let mut client = framed(client);
        let mut server = framed(server);

        let writer = tokio::spawn(async move {
            client.send(Bytes::from_static(b"first")).await.unwrap();
            client.send(Bytes::new()).await.unwrap();
            client.send(Bytes::from_static(b"second frame")).await.unwrap();
        });

        assert_eq!(server.next().await.unwrap().unwrap(), &b"first"[..]);
        assert_eq!(server.next().await.unwrap().unwrap(), &b""[..]);
        assert_eq!(server.next().await.unwrap().unwrap(), &b"second frame"[..]);
        writer.await.unwrap();

        // writer dropped: clean end of stream
        assert!(server.next().await.is_none());
    }

    #[tokio::test]
    async fn test_one_frame_per_datagram() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = b.local_addr().unwrap();

        let mut sender = udp_framed(a);
        let mut receiver = udp_framed(b);
        sender.send((Bytes::from_static(b"one"), to)).await.unwrap();
        sender.send((Bytes::from_static(b"two"), to)).await.unwrap();

        let (first, _) = receiver.next().await.unwrap().unwrap();
        let (second, _) = receiver.next().await.unwrap().unwrap();
        assert_eq!(first, &b"one"[..]);
        assert_eq!(second, &b"two"[..]);
    }
}
