//! Validated, framed stream link
//!
//! Wraps any byte stream (TCP socket, RFCOMM socket, accessory file) once
//! the handshake has succeeded. A link that fails the handshake is shut
//! down and never handed out.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::error::{HandshakeError, NetworkError};
use crate::protocol::{framed, handshake, Role};

/// Longest a close waits for unsent frames to drain
const CLOSE_TIMEOUT: Duration = Duration::from_millis(250);

/// Framed stream that passed the handshake
pub struct StreamLink<S> {
    framed: Option<Framed<S, LengthDelimitedCodec>>,
    peer: String,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake for `role` over a freshly opened stream
    pub async fn establish(
        mut stream: S,
        role: Role,
        limit: Duration,
        peer: impl Into<String>,
    ) -> Result<Self, HandshakeError> {
        let peer = peer.into();
        match handshake::perform(&mut stream, role, limit).await {
            Ok(()) => {
                debug!("Handshake with {} succeeded", peer);
                Ok(Self {
                    framed: Some(framed(stream)),
                    peer,
                })
            }
            Err(e) => {
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Write one frame
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        let framed = self.framed.as_mut().ok_or(NetworkError::NotConnected)?;
        framed
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    /// Read one frame; `None` when the peer closed the stream
    pub async fn recv(&mut self) -> Result<Option<Bytes>, NetworkError> {
        let framed = self.framed.as_mut().ok_or(NetworkError::NotConnected)?;
        match framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(NetworkError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }

    /// Flush and shut the stream down; false if it was already closed
    ///
    /// A peer that stopped reading cannot hold the close up for longer
    /// than [`CLOSE_TIMEOUT`]; whatever is still queued is dropped.
    pub async fn close(&mut self) -> bool {
        match self.framed.take() {
            Some(mut framed) => {
                if timeout(CLOSE_TIMEOUT, SinkExt::<Bytes>::close(&mut framed)).await.is_err() {
                    debug!("{} is not reading, dropping unsent frames", self.peer);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HANDSHAKE_TIMEOUT;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_flow_after_handshake() {
        let (phone, pc) = duplex(4096);

        let acceptor = tokio::spawn(async move {
            let mut link = StreamLink::establish(pc, Role::Acceptor, HANDSHAKE_TIMEOUT, "phone")
                .await
                .unwrap();
            link.recv().await.unwrap()
        });

        let mut link = StreamLink::establish(phone, Role::Initiator, HANDSHAKE_TIMEOUT, "pc")
            .await
            .unwrap();
        link.send(b"pcm").await.unwrap();

        assert_eq!(acceptor.await.unwrap().as_deref(), Some(&b"pcm"[..]));
        assert_eq!(link.peer(), "pc");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (phone, pc) = duplex(4096);
        let acceptor = tokio::spawn(async move {
            StreamLink::establish(pc, Role::Acceptor, HANDSHAKE_TIMEOUT, "phone").await
        });

        let mut link = StreamLink::establish(phone, Role::Initiator, HANDSHAKE_TIMEOUT, "pc")
            .await
            .unwrap();
        let _pc = acceptor.await.unwrap().unwrap();

        assert!(link.close().await);
        assert!(!link.close().await);
        assert!(!link.is_open());
        assert!(matches!(
            link.send(b"late").await,
            Err(NetworkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stalled_peer() {
        let (phone, pc) = duplex(64);
        let acceptor = tokio::spawn(async move {
            let mut pc = pc;
            handshake::respond(&mut pc, HANDSHAKE_TIMEOUT).await.unwrap();
            // keeps the pipe open without ever reading
            pc
        });

        let mut link = StreamLink::establish(phone, Role::Initiator, HANDSHAKE_TIMEOUT, "pc")
            .await
            .unwrap();
        let _pc = acceptor.await.unwrap();

        let stuck = timeout(Duration::from_millis(50), link.send(&[0u8; 4096])).await;
        assert!(stuck.is_err());

        let started = tokio::time::Instant::now();
        assert!(link.close().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!link.is_open());
    }
}
