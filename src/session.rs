//! Streaming session
//!
//! A session owns one region buffer and at most one live transport. Each
//! `attempt_connect` builds a fresh transport from the session's
//! [`ConnectOption`], clears the buffer, and on success spawns a task that
//! either drains the buffer into the link (sender) or fills it from the
//! link (receiver). The task never reconnects; when the link dies the
//! session falls back to `Idle` and the caller decides whether to retry.
//!
//! ```text
//! Idle ──attempt_connect──▶ Connecting ──ok──▶ Streaming
//!  ▲                            │                  │ link lost / stop
//!  └────────── failed ──────────┘                  ▼
//!  └──────────────────────────────────────── Disconnected
//! ```

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::buffer::{create_shared_buffer, SharedRegionBuffer};
use crate::config::{AppConfig, AudioConfig, NetworkConfig};
use crate::error::{Result, SessionError};
use crate::protocol::AudioPacket;
use crate::transport::{ConnectOption, Connection, Transport};

/// Which way audio moves through the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Buffer to link (phone side)
    Drain,
    /// Link to buffer (PC side)
    Fill,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Disconnected,
}

/// Notification for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Connected { info: String },
    ConnectFailed { message: String },
    Disconnected { reason: String },
}

/// Why a streaming task ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum StopReason {
    Stopped,
    LinkLost,
    PeerClosed,
    SendFailed(String),
    ReceiveFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Stopped => f.write_str("stopped"),
            StopReason::LinkLost => f.write_str("link lost"),
            StopReason::PeerClosed => f.write_str("peer closed the connection"),
            StopReason::SendFailed(e) => write!(f, "send failed: {e}"),
            StopReason::ReceiveFailed(e) => write!(f, "receive failed: {e}"),
        }
    }
}

/// Snapshot of session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub bytes_received: u64,
    /// Bytes that did not fit the buffer or a whole sample frame
    pub bytes_dropped: u64,
    pub invalid_packets: u64,
    pub connections: u64,
    pub last_connected: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    chunks_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_dropped: AtomicU64,
    invalid_packets: AtomicU64,
    connections: AtomicU64,
    last_connected: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            last_connected: *self.last_connected.lock(),
        }
    }
}

/// State shared with the streaming task
struct Shared {
    buffer: SharedRegionBuffer,
    state: Mutex<SessionState>,
    running: AtomicBool,
    stats: Counters,
    events: Sender<SessionEvent>,
    audio: AudioConfig,
    chunk_size: usize,
    idle_interval: Duration,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let changed = {
            let mut current = self.state.lock();
            std::mem::replace(&mut *current, state) != state
        };
        if changed {
            debug!("Session state -> {:?}", state);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            debug!("Event queue full, dropping {:?}", event);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// One connection lifecycle at a time over a persistent buffer
pub struct StreamSession {
    id: Uuid,
    option: ConnectOption,
    direction: Direction,
    network: NetworkConfig,
    stop_timeout: Duration,
    shared: Arc<Shared>,
    events: Receiver<SessionEvent>,
    task: Option<JoinHandle<()>>,
    stop_signal: Option<Arc<Notify>>,
}

impl StreamSession {
    /// Create a session with its own buffer
    pub fn new(option: ConnectOption, direction: Direction, config: &AppConfig) -> Result<Self> {
        let buffer = create_shared_buffer(config.buffer.capacity)?;
        Ok(Self::with_buffer(option, direction, buffer, config))
    }

    /// Create a session around an existing buffer
    pub fn with_buffer(
        option: ConnectOption,
        direction: Direction,
        buffer: SharedRegionBuffer,
        config: &AppConfig,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.session.event_capacity.max(1));

        Self {
            id: Uuid::new_v4(),
            option,
            direction,
            network: config.network.clone(),
            stop_timeout: config.session.stop_timeout(),
            shared: Arc::new(Shared {
                buffer,
                state: Mutex::new(SessionState::Idle),
                running: AtomicBool::new(false),
                stats: Counters::default(),
                events: tx,
                audio: config.audio.clone(),
                chunk_size: config.buffer.chunk_size.max(1),
                idle_interval: config.session.idle_interval(),
            }),
            events: rx,
            task: None,
            stop_signal: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Buffer shared with the producer or consumer
    pub fn buffer(&self) -> SharedRegionBuffer {
        self.shared.buffer.clone()
    }

    /// Observer handle; every clone competes for the same events
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// Build a fresh transport, connect it and start streaming
    ///
    /// Failure leaves the session `Idle`; no retry happens here.
    pub async fn attempt_connect(&mut self) -> std::result::Result<(), SessionError> {
        // a task that cleared `running` is already on its way out
        if self.shared.is_running() && self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(SessionError::AlreadyStreaming);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(session = %self.id, "Previous streaming task ended abnormally: {}", e);
            }
        }

        self.shared.set_state(SessionState::Connecting);
        self.shared.buffer.clear().await;

        let mut transport = self.option.build(&self.network);
        info!(session = %self.id, "Connecting via {}", transport.info());

        if !transport.connect().await {
            let target = transport.info();
            self.shared.emit(SessionEvent::ConnectFailed {
                message: format!("could not connect to {target}"),
            });
            self.shared.set_state(SessionState::Idle);
            return Err(SessionError::ConnectFailed(target));
        }

        let info = transport.info();
        info!(session = %self.id, "Streaming with {} ({:?})", info, self.direction);
        self.shared.stats.connections.fetch_add(1, Ordering::Relaxed);
        *self.shared.stats.last_connected.lock() = Some(Utc::now());
        self.shared.emit(SessionEvent::Connected { info });
        self.shared.set_state(SessionState::Streaming);

        self.shared.running.store(true, Ordering::SeqCst);
        let stop = Arc::new(Notify::new());
        let span = tracing::info_span!("stream", session = %self.id);
        self.task = Some(tokio::spawn(
            run(self.shared.clone(), transport, self.direction, stop.clone()).instrument(span),
        ));
        self.stop_signal = Some(stop);
        Ok(())
    }

    /// Stop streaming and release the connection
    ///
    /// Waits for the task up to the stop timeout, then aborts it.
    pub async fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop_signal.take() {
            stop.notify_one();
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.stop_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session = %self.id, "Streaming task ended abnormally: {}", e),
                Err(_) => {
                    warn!(session = %self.id, "Streaming task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.shared.set_state(SessionState::Idle);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(shared: Arc<Shared>, mut transport: Transport, direction: Direction, stop: Arc<Notify>) {
    let reason = match direction {
        Direction::Drain => drain(&shared, &mut transport, &stop).await,
        Direction::Fill => fill(&shared, &mut transport, &stop).await,
    };

    transport.disconnect().await;
    shared.running.store(false, Ordering::SeqCst);

    if reason == StopReason::Stopped {
        info!("Streaming stopped");
    } else {
        warn!("Streaming ended: {}", reason);
    }
    shared.set_state(SessionState::Disconnected);
    shared.emit(SessionEvent::Disconnected {
        reason: reason.to_string(),
    });
    shared.set_state(SessionState::Idle);
}

/// Buffer to link
async fn drain(shared: &Shared, transport: &mut Transport, stop: &Notify) -> StopReason {
    let mut packet = AudioPacket {
        buffer: Vec::with_capacity(shared.chunk_size),
        sample_rate: shared.audio.sample_rate,
        channel_count: shared.audio.channel_count,
        audio_format: shared.audio.audio_format,
    };

    while shared.is_running() {
        if !transport.is_alive() {
            return StopReason::LinkLost;
        }

        let region = tokio::select! {
            region = shared.buffer.open_read_region(shared.chunk_size) => region,
            _ = stop.notified() => return StopReason::Stopped,
        };

        if region.is_empty() {
            region.close(0);
        } else {
            packet.buffer.clear();
            packet.buffer.extend_from_slice(region.as_slice());
            let frame = match packet.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    region.close(0);
                    return StopReason::SendFailed(e.to_string());
                }
            };

            let sent = tokio::select! {
                sent = transport.send_chunk(&frame) => sent,
                _ = stop.notified() => {
                    region.close(0);
                    return StopReason::Stopped;
                }
            };

            match sent {
                Ok(()) => {
                    let moved = region.len();
                    region.close(moved);
                    Counters::add(&shared.stats.bytes_sent, moved);
                    Counters::add(&shared.stats.chunks_sent, 1);
                }
                Err(e) => {
                    region.close(0);
                    return StopReason::SendFailed(e.to_string());
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.idle_interval) => {}
            _ = stop.notified() => return StopReason::Stopped,
        }
    }
    StopReason::Stopped
}

/// Link to buffer
async fn fill(shared: &Shared, transport: &mut Transport, stop: &Notify) -> StopReason {
    while shared.is_running() {
        if !transport.is_alive() {
            return StopReason::LinkLost;
        }

        let received = tokio::select! {
            received = transport.recv_chunk() => received,
            _ = stop.notified() => return StopReason::Stopped,
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => return StopReason::PeerClosed,
            Err(e) => return StopReason::ReceiveFailed(e.to_string()),
        };
        Counters::add(&shared.stats.bytes_received, frame.len());

        let packet = match AudioPacket::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Skipping undecodable frame: {}", e);
                Counters::add(&shared.stats.invalid_packets, 1);
                continue;
            }
        };

        // whole sample frames only, and only what fits
        let frame_size = packet.frame_size();
        let free = shared.buffer.capacity() - shared.buffer.size().await;
        let fits = packet.buffer.len().min(free);
        let take = fits - fits % frame_size;
        let written = shared.buffer.push(&packet.buffer[..take]).await;

        let dropped = packet.buffer.len() - written;
        if dropped > 0 {
            Counters::add(&shared.stats.bytes_dropped, dropped);
        }
    }
    StopReason::Stopped
}
