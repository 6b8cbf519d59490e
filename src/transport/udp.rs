//! UDP transport
//!
//! UDP has no connection, so one is simulated: the sender fires a
//! `Connect` datagram and waits for `ConnectAck` from the same address.
//! Without an explicit port the candidate range is probed one port at a
//! time. Payloads travel as `Data` datagrams with a wrapping sequence
//! number starting at 0, and the receiving side restores order through a
//! [`ReorderBuffer`].

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionState};
use crate::buffer::{InsertOutcome, ReorderBuffer, ReorderStats};
use crate::config::NetworkConfig;
use crate::discovery::NetworkCheck;
use crate::error::NetworkError;
use crate::protocol::{udp_framed, UdpMessage};

/// Kernel buffer size requested for both directions
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// How long a reorder gap may hold playback, counted from when it opened
const GAP_TIMEOUT: Duration = Duration::from_millis(40);

/// Unreadable datagrams tolerated in a row before the socket is given up
const MAX_DATAGRAM_ERRORS: usize = 16;

type DatagramLink = UdpFramed<LengthDelimitedCodec, Arc<UdpSocket>>;

/// Create a non-blocking UDP socket with enlarged kernel buffers
pub fn create_socket(bind: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// Bind the first free port in `first..=last` for receiving
pub async fn bind_acceptor(ip: IpAddr, first: u16, last: u16) -> Result<UdpSocket, NetworkError> {
    for port in first..=last {
        let bound = create_socket(SocketAddr::new(ip, port)).and_then(UdpSocket::from_std);
        match bound {
            Ok(socket) => {
                info!("UDP socket bound to {}:{}", ip, port);
                return Ok(socket);
            }
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }
    Err(NetworkError::BindFailed(format!("no free UDP port in {first}..={last} on {ip}")))
}

enum Endpoint {
    Dial {
        ip: IpAddr,
        port: Option<u16>,
        check: Option<Arc<dyn NetworkCheck>>,
    },
    Accept {
        socket: Arc<UdpSocket>,
    },
}

/// Datagram link
pub struct UdpTransport {
    endpoint: Endpoint,
    candidate_ports: Vec<u16>,
    connect_timeout: Duration,
    probe_timeout: Duration,
    accept_timeout: Option<Duration>,
    reorder_window: usize,
    link: Option<DatagramLink>,
    peer: Option<SocketAddr>,
    /// Next outgoing sequence number
    sequence: u32,
    reorder: Option<ReorderBuffer<Bytes>>,
    /// When the gap currently holding playback opened
    gap_since: Option<Instant>,
    state: ConnectionState,
}

impl UdpTransport {
    fn with_endpoint(endpoint: Endpoint, config: &NetworkConfig) -> Self {
        Self {
            endpoint,
            candidate_ports: config.udp_candidate_ports().collect(),
            connect_timeout: config.connect_timeout(),
            probe_timeout: config.probe_timeout(),
            accept_timeout: config.accept_timeout(),
            reorder_window: config.reorder_window,
            link: None,
            peer: None,
            sequence: 0,
            reorder: None,
            gap_since: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Send to `ip`; probes the candidate ports when `port` is `None`
    pub fn dial(ip: IpAddr, port: Option<u16>, config: &NetworkConfig) -> Self {
        Self::with_endpoint(
            Endpoint::Dial {
                ip,
                port,
                check: None,
            },
            config,
        )
    }

    /// Wait for a sender on a bound socket
    pub fn accept_on(socket: Arc<UdpSocket>, config: &NetworkConfig) -> Self {
        Self::with_endpoint(Endpoint::Accept { socket }, config)
    }

    /// Require `check` to pass before dialing
    pub fn with_network_check(mut self, check: Option<Arc<dyn NetworkCheck>>) -> Self {
        if let Endpoint::Dial { check: slot, .. } = &mut self.endpoint {
            *slot = check;
        }
        self
    }

    async fn open(&mut self) -> Result<(), NetworkError> {
        let reorder = ReorderBuffer::new(self.reorder_window)
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        let (link, peer) = match &self.endpoint {
            Endpoint::Dial { ip, port, check } => {
                if let Some(check) = check {
                    if !check.is_usable(*ip) {
                        return Err(NetworkError::NoNetwork);
                    }
                }

                let bind = match ip {
                    IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                    IpAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
                };
                let socket = create_socket(bind)
                    .and_then(UdpSocket::from_std)
                    .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
                let mut link = udp_framed(Arc::new(socket));

                let peer = match port {
                    Some(port) => {
                        let target = SocketAddr::new(*ip, *port);
                        probe(&mut link, target, self.connect_timeout).await?;
                        target
                    }
                    None => find_port(&mut link, *ip, &self.candidate_ports, self.probe_timeout).await?,
                };
                (link, peer)
            }
            Endpoint::Accept { socket } => {
                let mut link = udp_framed(socket.clone());
                let peer = wait_for_sender(&mut link, self.accept_timeout).await?;
                (link, peer)
            }
        };

        self.link = Some(link);
        self.peer = Some(peer);
        self.reorder = Some(reorder);
        self.gap_since = None;
        self.sequence = 0;
        Ok(())
    }

    async fn handle_message(&mut self, message: UdpMessage, from: SocketAddr) {
        match message {
            UdpMessage::Data { sequence, payload } if self.peer == Some(from) => {
                let Some(reorder) = self.reorder.as_mut() else {
                    return;
                };
                match reorder.insert(sequence, Bytes::from(payload)) {
                    InsertOutcome::Accepted => {}
                    InsertOutcome::Resynced => {
                        debug!("Sequence jumped to {}, window restarted", sequence);
                        self.gap_since = None;
                    }
                    outcome => debug!("Dropped datagram {} ({:?})", sequence, outcome),
                }
            }
            UdpMessage::Connect if matches!(self.endpoint, Endpoint::Accept { .. }) => {
                // sender restarted, or a new one replaced it
                if self.peer != Some(from) {
                    info!("UDP sender switched to {}", from);
                    self.peer = Some(from);
                }
                if let Some(reorder) = self.reorder.as_mut() {
                    reorder.reset();
                }
                self.gap_since = None;
                if let Some(link) = self.link.as_mut() {
                    if let Err(e) = send_message(link, &UdpMessage::ConnectAck, from).await {
                        debug!("Failed to acknowledge {}: {}", from, e);
                    }
                }
            }
            _ => {}
        }
    }

    /// Reordering statistics of the current connection
    pub fn reorder_stats(&self) -> Option<ReorderStats> {
        self.reorder.as_ref().map(ReorderBuffer::stats)
    }
}

impl Connection for UdpTransport {
    async fn connect(&mut self) -> bool {
        if self.is_alive() {
            return true;
        }

        self.state = ConnectionState::Connecting;
        match self.open().await {
            Ok(()) => {
                info!("UDP connected to {}", self.info());
                self.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                warn!("UDP connect via {} failed: {}", self.info(), e);
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    async fn disconnect(&mut self) -> bool {
        self.state = ConnectionState::Disconnected;
        if let Some(stats) = self.reorder_stats().filter(|stats| stats.received > 0) {
            info!(
                "UDP reorder: {} received, {} lost ({:.1}%), {} late, {} duplicates",
                stats.received,
                stats.lost,
                stats.loss_rate() * 100.0,
                stats.late,
                stats.duplicates
            );
        }
        self.reorder = None;
        self.gap_since = None;
        let peer = self.peer.take();
        match self.link.take() {
            Some(_) => {
                if let Some(peer) = peer {
                    info!("UDP disconnected from {}", peer);
                }
                true
            }
            None => false,
        }
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError> {
        let (Some(link), Some(peer)) = (self.link.as_mut(), self.peer) else {
            return Err(NetworkError::NotConnected);
        };

        let body = UdpMessage::Data {
            sequence: self.sequence,
            payload: chunk.to_vec(),
        }
        .encode()?;
        self.sequence = self.sequence.wrapping_add(1);

        if let Err(e) = link.send((body, peer)).await {
            warn!("UDP send to {} failed: {}", peer, e);
            self.disconnect().await;
            return Err(NetworkError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    /// Next in-order payload
    ///
    /// A missing sequence is given up on once later payloads have piled
    /// up behind it, or once it has held playback for the gap timeout.
    async fn recv_chunk(&mut self) -> Result<Option<Bytes>, NetworkError> {
        loop {
            let reorder = self.reorder.as_mut().ok_or(NetworkError::NotConnected)?;
            if let Some(payload) = reorder.pop_ready() {
                self.gap_since = None;
                return Ok(Some(payload));
            }
            let waiting = reorder.pending() > 0;

            let link = self.link.as_mut().ok_or(NetworkError::NotConnected)?;
            let received = if waiting {
                let since = *self.gap_since.get_or_insert_with(Instant::now);
                match timeout_at(since + GAP_TIMEOUT, next_message(link)).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.gap_since = None;
                        if let Some(payload) = self.reorder.as_mut().and_then(ReorderBuffer::skip_gap) {
                            return Ok(Some(payload));
                        }
                        continue;
                    }
                }
            } else {
                next_message(link).await
            };

            match received {
                Ok((message, from)) => self.handle_message(message, from).await,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    self.disconnect().await;
                    return Err(e);
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.link.is_some() && self.peer.is_some()
    }

    fn info(&self) -> String {
        match (self.peer, &self.endpoint) {
            (Some(peer), _) => peer.to_string(),
            (None, Endpoint::Dial { ip, port: Some(port), .. }) => SocketAddr::new(*ip, *port).to_string(),
            (None, Endpoint::Dial { ip, port: None, .. }) => format!("{ip} (port scan)"),
            (None, Endpoint::Accept { socket }) => match socket.local_addr() {
                Ok(addr) => format!("listening on {addr}"),
                Err(_) => "listening".to_string(),
            },
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

async fn send_message(link: &mut DatagramLink, message: &UdpMessage, to: SocketAddr) -> Result<(), NetworkError> {
    let body = message.encode()?;
    link.send((body, to))
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))
}

/// Next decodable message
///
/// Unreadable datagrams (oversized, truncated, ICMP resets surfacing as
/// errors) are skipped; only a run of them fails the link.
async fn next_message(link: &mut DatagramLink) -> Result<(UdpMessage, SocketAddr), NetworkError> {
    let mut errors = 0;
    loop {
        match link.next().await {
            Some(Ok((frame, from))) => match UdpMessage::decode(&frame) {
                Ok(message) => return Ok((message, from)),
                Err(e) => debug!("Dropping invalid datagram from {}: {}", from, e),
            },
            Some(Err(e)) => {
                errors += 1;
                if errors > MAX_DATAGRAM_ERRORS {
                    return Err(NetworkError::ReceiveFailed(e.to_string()));
                }
                debug!("Skipping unreadable datagram: {}", e);
                // the codec keeps the bad bytes around; start from a clean one
                *link = udp_framed(link.get_ref().clone());
            }
            None => return Err(NetworkError::ReceiveFailed("socket closed".to_string())),
        }
    }
}

/// Send `Connect` to `target` and wait for its `ConnectAck`
async fn probe(link: &mut DatagramLink, target: SocketAddr, limit: Duration) -> Result<(), NetworkError> {
    send_message(link, &UdpMessage::Connect, target).await?;

    timeout(limit, async {
        loop {
            let (message, from) = next_message(link).await?;
            if from == target && message == UdpMessage::ConnectAck {
                return Ok(());
            }
        }
    })
    .await
    .map_err(|_| NetworkError::Timeout)?
}

/// Probe `ports` in order; first one to acknowledge wins
async fn find_port(
    link: &mut DatagramLink,
    ip: IpAddr,
    ports: &[u16],
    limit: Duration,
) -> Result<SocketAddr, NetworkError> {
    for &port in ports {
        let target = SocketAddr::new(ip, port);
        match probe(link, target, limit).await {
            Ok(()) => return Ok(target),
            Err(e) => debug!("No UDP receiver on {}: {}", target, e),
        }
    }
    Err(NetworkError::NoTarget)
}

/// Wait for a `Connect` and acknowledge it
async fn wait_for_sender(link: &mut DatagramLink, limit: Option<Duration>) -> Result<SocketAddr, NetworkError> {
    let wait = async {
        loop {
            match next_message(link).await? {
                (UdpMessage::Connect, from) => {
                    send_message(link, &UdpMessage::ConnectAck, from).await?;
                    return Ok(from);
                }
                (_, from) => debug!("Ignoring datagram from {} while waiting for a sender", from),
            }
        }
    };

    match limit {
        Some(limit) => timeout(limit, wait).await.map_err(|_| NetworkError::Timeout)?,
        None => wait.await,
    }
}
