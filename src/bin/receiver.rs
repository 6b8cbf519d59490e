//! Microphone Receiver Application
//!
//! Waits for a phone, receives its audio and writes raw PCM to stdout
//! (pipe it into a player, e.g. `receiver | aplay -f S16_LE -r 16000`).
//!
//! Usage: `receiver [tcp|adb|udp] [bind-ip]`
//!
//! `adb` listens on loopback and sets up `adb reverse` so a phone plugged
//! in over USB reaches it on its own `127.0.0.1`.

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    buffer::SharedRegionBuffer,
    config::AppConfig,
    constants::*,
    session::{Direction, SessionEvent, StreamSession},
    discovery::local_address,
    transport::{bind_acceptor, bind_listener, AdbReverse, ConnectOption},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout carries the audio
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting microphone receiver");

    let config = AppConfig::from_env()?;

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "tcp".to_string());
    let ip: IpAddr = match (args.next(), config.network.bind_address) {
        (Some(ip), _) => ip.parse().context("Invalid bind address")?,
        (None, Some(ip)) => ip,
        (None, None) => local_address().unwrap_or_else(|e| {
            tracing::warn!("{}, listening on all interfaces", e);
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }),
    };

    let (first, last) = (config.network.port, config.network.max_port);
    let mut adb_reverse = None;
    let option = match mode.as_str() {
        "adb" => {
            let listener = bind_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), first, last).await?;
            let local = listener.local_addr()?;
            adb_reverse = Some(AdbReverse::start(config.network.port, local.port()).await?);
            tracing::info!("Waiting for a phone over ADB on {}", local);
            ConnectOption::TcpListen {
                listener: Arc::new(listener),
            }
        }
        "tcp" => {
            let listener = bind_listener(ip, first, last).await?;
            tracing::info!("Waiting for a phone on TCP {}", listener.local_addr()?);
            ConnectOption::TcpListen {
                listener: Arc::new(listener),
            }
        }
        "udp" => {
            let socket = bind_acceptor(ip, first, last).await?;
            tracing::info!("Waiting for a phone on UDP {}", socket.local_addr()?);
            ConnectOption::UdpListen {
                socket: Arc::new(socket),
            }
        }
        other => bail!("Unknown mode '{other}', expected tcp, adb or udp"),
    };

    let mut session = StreamSession::new(option, Direction::Fill, &config)?;
    let events = session.events();

    let playback = tokio::spawn(play_to_stdout(session.buffer(), config.buffer.chunk_size));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut retry = tokio::time::interval(Duration::from_secs(1));
    let mut stats_tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = stats_tick.tick() => {
                while let Ok(event) = events.try_recv() {
                    match event {
                        SessionEvent::Connected { info } => tracing::info!("Phone connected: {}", info),
                        SessionEvent::Disconnected { reason } => tracing::info!("Phone disconnected: {}", reason),
                        other => tracing::debug!("{:?}", other),
                    }
                }
                if session.is_streaming() {
                    tracing::info!("Stats: {}", serde_json::to_string(&session.stats())?);
                }
            }
            _ = retry.tick(), if !session.is_streaming() => {
                // accepting waits for a client, so keep Ctrl+C responsive
                tokio::select! {
                    result = session.attempt_connect() => {
                        if let Err(e) = result {
                            tracing::warn!("{}", e);
                        }
                    }
                    _ = &mut ctrl_c => break,
                }
            }
        }
    }

    session.stop().await;
    if let Some(tunnel) = adb_reverse {
        // failure is already logged
        let _ = tunnel.stop().await;
    }
    playback.abort();
    tracing::info!("Final stats: {}", serde_json::to_string(&session.stats())?);
    Ok(())
}

/// Pull audio out of the buffer and write it to stdout
async fn play_to_stdout(buffer: SharedRegionBuffer, chunk_size: usize) {
    let mut stdout = tokio::io::stdout();
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let n = buffer.pop(&mut chunk).await;
        if n == 0 {
            // Small sleep to prevent busy-waiting
            tokio::time::sleep(Duration::from_micros(IDLE_INTERVAL_US)).await;
            continue;
        }
        if let Err(e) = stdout.write_all(&chunk[..n]).await {
            tracing::error!("Failed to write audio to stdout: {}", e);
            break;
        }
    }
}
