//! Peer validation exchanged right after a raw link comes up
//!
//! The initiator writes `AndroidMicCheck`; the acceptor must answer
//! `AndroidMicCheckAck` before the deadline. Raw Bluetooth and USB links do
//! not reliably report "wrong device" or "stale connection", so nothing is
//! streamed until this exchange succeeds.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::constants::{CONNECT_TIMEOUT_MS, PROBE_TIMEOUT_MS};
use crate::error::HandshakeError;

/// Sent by the connecting side
pub const CHECK: &str = "AndroidMicCheck";

/// Expected answer from the accepting side
pub const CHECK_ACK: &str = "AndroidMicCheckAck";

/// Deadline for a regular connection
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(CONNECT_TIMEOUT_MS);

/// Deadline when probing many candidates
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(PROBE_TIMEOUT_MS);

/// Side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Run the exchange for `role`
pub async fn perform<S>(stream: &mut S, role: Role, limit: Duration) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match role {
        Role::Initiator => initiate(stream, limit).await,
        Role::Acceptor => respond(stream, limit).await,
    }
}

/// Send the check and wait for the acknowledgment
pub async fn initiate<S>(stream: &mut S, limit: Duration) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(limit, async {
        stream.write_all(CHECK.as_bytes()).await?;
        stream.flush().await?;
        expect(stream, CHECK_ACK).await
    })
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

/// Wait for the check and answer with the acknowledgment
pub async fn respond<S>(stream: &mut S, limit: Duration) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(limit, async {
        expect(stream, CHECK).await?;
        stream.write_all(CHECK_ACK.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    })
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

async fn expect<S: AsyncRead + Unpin>(stream: &mut S, expected: &str) -> Result<(), HandshakeError> {
    let expected = expected.as_bytes();
    let mut received = Vec::with_capacity(expected.len());
    let mut chunk = [0u8; 100];

    while received.len() < expected.len() {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        received.extend_from_slice(&chunk[..n]);
        if !expected.starts_with(&received) {
            return Err(HandshakeError::Mismatch(
                String::from_utf8_lossy(&received).into_owned(),
            ));
        }
    }
    Ok(())
}
