//! Microphone Sender Application
//!
//! Reads raw PCM from stdin and streams it to a receiver.
//!
//! Usage: `sender [tcp|adb|udp] [target]`
//!
//! - `tcp 192.168.1.2:55555` dials the PC over the network
//! - `adb 55555` dials the loopback end of `adb reverse tcp:55555 tcp:55555`
//! - `udp 192.168.1.2` probes the UDP port range, `udp 192.168.1.2:55555`
//!   uses one port

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    buffer::SharedRegionBuffer,
    config::AppConfig,
    session::{Direction, StreamSession},
    transport::ConnectOption,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is left alone
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting microphone sender");

    let config = AppConfig::from_env()?;

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "adb".to_string());
    let option = parse_target(&mode, args.next().as_deref(), &config)?;
    tracing::info!("Target: {:?}", option);

    let mut session = StreamSession::new(option, Direction::Drain, &config)?;
    tracing::info!("Session {} ({} byte buffer)", session.id(), config.buffer.capacity);

    // Feed stdin into the buffer from a plain thread
    let (eof_tx, mut eof_rx) = oneshot::channel();
    let buffer = session.buffer();
    let chunk_size = config.buffer.chunk_size;
    std::thread::spawn(move || {
        read_stdin(buffer, chunk_size);
        let _ = eof_tx.send(());
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut retry = tokio::time::interval(Duration::from_secs(1));

    tracing::info!("Streaming - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = &mut eof_rx => {
                tracing::info!("Input ended, flushing buffer");
                wait_until_drained(&session).await;
                break;
            }
            _ = retry.tick(), if !session.is_streaming() => {
                if let Err(e) = session.attempt_connect().await {
                    tracing::warn!("{}; retrying", e);
                }
            }
        }
    }

    session.stop().await;
    tracing::info!("Final stats: {}", serde_json::to_string(&session.stats())?);
    Ok(())
}

fn parse_target(mode: &str, target: Option<&str>, config: &AppConfig) -> Result<ConnectOption> {
    let option = match mode {
        "tcp" => {
            let target = target.context("tcp mode needs a target address")?;
            let addr = match target.parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(_) => {
                    let ip: IpAddr = target.parse().context("Invalid target address")?;
                    SocketAddr::new(ip, config.network.port)
                }
            };
            ConnectOption::Tcp { addr }
        }
        "adb" => {
            let port = match target {
                Some(port) => port.parse().context("Invalid port")?,
                None => config.network.port,
            };
            ConnectOption::Adb { port }
        }
        "udp" => {
            let target = target.context("udp mode needs a target address")?;
            match target.parse::<SocketAddr>() {
                Ok(addr) => ConnectOption::Udp {
                    ip: addr.ip(),
                    port: Some(addr.port()),
                },
                Err(_) => ConnectOption::Udp {
                    ip: target.parse().context("Invalid target address")?,
                    port: None,
                },
            }
        }
        other => bail!("Unknown mode '{other}', expected tcp, adb or udp"),
    };
    Ok(option)
}

/// Copy stdin into the buffer until EOF; audio that does not fit is dropped
fn read_stdin(buffer: SharedRegionBuffer, chunk_size: usize) {
    let mut stdin = std::io::stdin().lock();
    let mut chunk = vec![0u8; chunk_size];
    let mut dropped: u64 = 0;

    loop {
        let n = match stdin.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let written = buffer.blocking_push(&chunk[..n]);
        if written < n {
            dropped += (n - written) as u64;
            tracing::trace!("Buffer full, dropped {} bytes so far", dropped);
        }
    }

    if dropped > 0 {
        tracing::info!("Dropped {} bytes while the buffer was full", dropped);
    }
}

async fn wait_until_drained(session: &StreamSession) {
    let buffer = session.buffer();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.is_streaming() && !buffer.is_empty().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
