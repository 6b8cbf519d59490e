//! TCP transport
//!
//! Dials a PC over Wi-Fi, dials loopback through an ADB tunnel, or waits
//! on a shared listener for a phone. Accepted clients that fail the
//! handshake are dropped and the listener keeps waiting.

use bytes::Bytes;
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::link::StreamLink;
use super::{Connection, ConnectionState};
use crate::config::NetworkConfig;
use crate::discovery::NetworkCheck;
use crate::error::NetworkError;
use crate::protocol::Role;

enum Endpoint {
    Dial {
        addr: SocketAddr,
        check: Option<Arc<dyn NetworkCheck>>,
    },
    Accept {
        listener: Arc<TcpListener>,
    },
}

/// TCP link
pub struct TcpTransport {
    endpoint: Endpoint,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    accept_timeout: Option<Duration>,
    keepalive: bool,
    link: Option<StreamLink<TcpStream>>,
    state: ConnectionState,
}

impl TcpTransport {
    fn with_endpoint(endpoint: Endpoint, config: &NetworkConfig) -> Self {
        Self {
            endpoint,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            accept_timeout: config.accept_timeout(),
            keepalive: false,
            link: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Dial `addr`
    pub fn dial(addr: SocketAddr, config: &NetworkConfig) -> Self {
        Self::with_endpoint(Endpoint::Dial { addr, check: None }, config)
    }

    /// Dial the loopback end of an `adb reverse` tunnel
    pub fn adb(port: u16, config: &NetworkConfig) -> Self {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let mut transport = Self::dial(addr, config);
        transport.keepalive = true;
        transport
    }

    /// Wait for a client on `listener`
    pub fn accept_on(listener: Arc<TcpListener>, config: &NetworkConfig) -> Self {
        let mut transport = Self::with_endpoint(Endpoint::Accept { listener }, config);
        transport.keepalive = true;
        transport
    }

    /// Require `check` to pass before dialing
    pub fn with_network_check(mut self, check: Option<Arc<dyn NetworkCheck>>) -> Self {
        if let Endpoint::Dial { check: slot, .. } = &mut self.endpoint {
            *slot = check;
        }
        self
    }

    async fn open(&self) -> Result<StreamLink<TcpStream>, NetworkError> {
        match &self.endpoint {
            Endpoint::Dial { addr, check } => {
                if let Some(check) = check {
                    if !check.is_usable(addr.ip()) {
                        return Err(NetworkError::NoNetwork);
                    }
                }

                let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| NetworkError::Timeout)?
                    .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
                configure_stream(&stream, self.keepalive);

                let peer = addr.to_string();
                let link =
                    StreamLink::establish(stream, Role::Initiator, self.handshake_timeout, peer)
                        .await?;
                Ok(link)
            }
            Endpoint::Accept { listener } => {
                accept_client(listener, self.accept_timeout, self.handshake_timeout).await
            }
        }
    }
}

impl Connection for TcpTransport {
    async fn connect(&mut self) -> bool {
        if self.link.is_some() {
            return true;
        }

        self.state = ConnectionState::Connecting;
        match self.open().await {
            Ok(link) => {
                info!("TCP connected to {}", link.peer());
                self.link = Some(link);
                self.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                warn!("TCP connect via {} failed: {}", self.info(), e);
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
                info!("TCP disconnected from {}", link.peer());
                true
            }
            None => false,
        }
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError> {
        let link = self.link.as_mut().ok_or(NetworkError::NotConnected)?;
        if let Err(e) = link.send(chunk).await {
            warn!("TCP send failed: {}", e);
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
                debug!("TCP peer closed the stream");
                self.disconnect().await;
                Ok(None)
            }
            Err(e) => {
                warn!("TCP receive failed: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_open())
    }

    fn info(&self) -> String {
        match (&self.link, &self.endpoint) {
            (Some(link), _) => link.peer().to_string(),
            (None, Endpoint::Dial { addr, .. }) => addr.to_string(),
            (None, Endpoint::Accept { listener }) => match listener.local_addr() {
                Ok(addr) => format!("listening on {addr}"),
                Err(_) => "listening".to_string(),
            },
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

fn configure_stream(stream: &TcpStream, keepalive: bool) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    if keepalive {
        if let Err(e) = SockRef::from(stream).set_keepalive(true) {
            debug!("Failed to enable keepalive: {}", e);
        }
    }
}

/// Accept until a client passes the handshake
async fn accept_client(
    listener: &TcpListener,
    accept_timeout: Option<Duration>,
    handshake_timeout: Duration,
) -> Result<StreamLink<TcpStream>, NetworkError> {
    let deadline = accept_timeout.map(|limit| Instant::now() + limit);

    loop {
        let accepted = match deadline {
            Some(deadline) => timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| NetworkError::Timeout)?,
            None => listener.accept().await,
        };
        let (stream, peer) = accepted.map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        configure_stream(&stream, true);

        match StreamLink::establish(stream, Role::Acceptor, handshake_timeout, peer.to_string()).await {
            Ok(link) => return Ok(link),
            Err(e) => debug!("Rejected client {}: {}", peer, e),
        }
    }
}

/// Bind the first free port in `first..=last`
pub async fn bind_listener(ip: IpAddr, first: u16, last: u16) -> Result<TcpListener, NetworkError> {
    for port in first..=last {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => {
                info!("TCP listener bound to {}:{}", ip, port);
                return Ok(listener);
            }
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }
    Err(NetworkError::BindFailed(format!("no free TCP port in {first}..={last} on {ip}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CHECK, CHECK_ACK};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            require_network: false,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_dial_and_accept_over_loopback() {
        let config = loopback_config();
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();

        let mut acceptor = TcpTransport::accept_on(listener, &config);
        let server = tokio::spawn(async move {
            assert!(acceptor.connect().await);
            let frame = acceptor.recv_chunk().await.unwrap();
            (acceptor, frame)
        });

        let mut dialer = TcpTransport::dial(addr, &config);
        assert!(dialer.connect().await);
        assert_eq!(dialer.state(), ConnectionState::Connected);
        dialer.send_chunk(b"hello").await.unwrap();

        let (acceptor, frame) = server.await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
        assert!(acceptor.is_alive());
    }

    #[tokio::test]
    async fn test_acceptor_skips_invalid_client() {
        let config = loopback_config();
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();

        let mut acceptor = TcpTransport::accept_on(listener, &config);
        let server = tokio::spawn(async move { acceptor.connect().await });

        let mut stranger = TcpStream::connect(addr).await.unwrap();
        stranger.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut rest = Vec::new();
        // dropped without an answer
        stranger.read_to_end(&mut rest).await.ok();
        assert!(rest.is_empty());

        let mut phone = TcpStream::connect(addr).await.unwrap();
        phone.write_all(CHECK.as_bytes()).await.unwrap();
        let mut ack = vec![0u8; CHECK_ACK.len()];
        phone.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CHECK_ACK.as_bytes());

        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_accept_timeout_fails_connect() {
        let config = NetworkConfig {
            accept_timeout_ms: Some(30),
            ..loopback_config()
        };
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());

        let mut acceptor = TcpTransport::accept_on(listener, &config);
        assert!(!acceptor.connect().await);
        assert_eq!(acceptor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_dial_returns_false() {
        // grab a free port, then release it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = TcpTransport::adb(port, &loopback_config());
        assert!(!transport.connect().await);
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_bind_listener_skips_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let listener = bind_listener(ip, port, port.saturating_add(20)).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), port);
    }
}
