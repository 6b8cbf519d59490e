//! Integration tests over loopback sockets.
//!
//! A drain session on one side and a fill session (or a raw peer) on the
//! other, talking through real TCP and UDP sockets on 127.0.0.1.

use std::sync::Arc;
use std::time::Duration;

use mic_relay::{
    config::AppConfig,
    protocol::{framed, AudioPacket, CHECK, CHECK_ACK},
    session::{Direction, SessionEvent, SessionState, StreamSession},
    transport::{ConnectOption, Connection},
};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

fn loopback_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.network.require_network = false;
    config.network.accept_timeout_ms = Some(2000);
    config
}

fn test_audio(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Pop from `session`'s buffer until `len` bytes arrived
async fn collect(session: &StreamSession, len: usize) -> Vec<u8> {
    let buffer = session.buffer();
    let mut received = Vec::with_capacity(len);
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while received.len() < len {
        assert!(tokio::time::Instant::now() < deadline, "only {} bytes arrived", received.len());
        let n = buffer.pop(&mut chunk).await;
        if n == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        received.extend_from_slice(&chunk[..n]);
    }
    received
}

async fn next_disconnect(session: &StreamSession) -> String {
    let events = session.events();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Disconnected { reason } = event {
                return reason;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no disconnect event");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_tcp_drain_to_fill() {
    let config = loopback_config();
    let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
    let port = listener.local_addr().unwrap().port();

    let mut pc = StreamSession::new(ConnectOption::TcpListen { listener }, Direction::Fill, &config).unwrap();
    let mut phone = StreamSession::new(ConnectOption::Adb { port }, Direction::Drain, &config).unwrap();

    let (accepted, dialed) = tokio::join!(pc.attempt_connect(), phone.attempt_connect());
    accepted.unwrap();
    dialed.unwrap();
    assert_eq!(pc.state(), SessionState::Streaming);
    assert_eq!(phone.state(), SessionState::Streaming);

    let audio = test_audio(4000);
    assert_eq!(phone.buffer().push(&audio).await, audio.len());

    assert_eq!(collect(&pc, audio.len()).await, audio);

    phone.stop().await;
    assert_eq!(next_disconnect(&pc).await, "peer closed the connection");

    let sent = phone.stats();
    let received = pc.stats();
    assert_eq!(sent.bytes_sent, 4000);
    assert!(received.bytes_received > 4000);
    assert_eq!(received.bytes_dropped, 0);
    assert_eq!(received.invalid_packets, 0);
}

#[tokio::test]
async fn test_udp_drain_to_fill() {
    let config = loopback_config();
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = socket.local_addr().unwrap().port();

    let mut pc = StreamSession::new(ConnectOption::UdpListen { socket }, Direction::Fill, &config).unwrap();
    let mut phone = StreamSession::new(
        ConnectOption::Udp {
            ip: "127.0.0.1".parse().unwrap(),
            port: Some(port),
        },
        Direction::Drain,
        &config,
    )
    .unwrap();

    let (accepted, dialed) = tokio::join!(pc.attempt_connect(), phone.attempt_connect());
    accepted.unwrap();
    dialed.unwrap();

    let audio = test_audio(2048);
    assert_eq!(phone.buffer().push(&audio).await, audio.len());
    assert_eq!(collect(&pc, audio.len()).await, audio);

    phone.stop().await;
    pc.stop().await;
    assert_eq!(pc.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_wrong_ack_is_rejected() {
    let config = loopback_config();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let impostor = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut check = vec![0u8; CHECK.len()];
        stream.read_exact(&mut check).await.unwrap();
        stream.write_all(b"NotAndroidMic").await.unwrap();

        // the phone hangs up without sending audio
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.ok();
        rest
    });

    let mut transport = ConnectOption::Adb { port }.build(&config.network);
    assert!(!transport.connect().await);
    assert!(!transport.is_alive());
    assert!(transport.send_chunk(b"audio").await.is_err());

    assert!(impostor.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let config = loopback_config();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let pc = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut check = vec![0u8; CHECK.len()];
        stream.read_exact(&mut check).await.unwrap();
        stream.write_all(CHECK_ACK.as_bytes()).await.unwrap();

        let mut stream = framed(stream);
        let frame = stream.next().await.unwrap().unwrap();
        let end = stream.next().await;
        (frame, end)
    });

    let mut transport = ConnectOption::Adb { port }.build(&config.network);
    assert!(transport.connect().await);
    assert_eq!(transport.info(), format!("127.0.0.1:{port}"));

    let packet = AudioPacket {
        buffer: vec![1, 2],
        sample_rate: 16000,
        channel_count: 1,
        audio_format: Default::default(),
    };
    transport.send_chunk(&packet.encode().unwrap()).await.unwrap();

    assert!(transport.disconnect().await);
    assert!(!transport.disconnect().await);

    let (frame, end) = pc.await.unwrap();
    assert_eq!(AudioPacket::decode(&frame).unwrap(), packet);
    assert!(end.is_none());
}

#[tokio::test]
async fn test_reconnect_after_peer_restart() {
    let config = loopback_config();
    let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
    let port = listener.local_addr().unwrap().port();

    let mut pc = StreamSession::new(ConnectOption::TcpListen { listener }, Direction::Fill, &config).unwrap();

    for round in 0..2 {
        let mut phone = StreamSession::new(ConnectOption::Adb { port }, Direction::Drain, &config).unwrap();
        let (accepted, dialed) = tokio::join!(pc.attempt_connect(), phone.attempt_connect());
        accepted.unwrap();
        dialed.unwrap();

        let audio = test_audio(512 + round * 100);
        phone.buffer().push(&audio).await;
        assert_eq!(collect(&pc, audio.len()).await, audio);

        phone.stop().await;
        next_disconnect(&pc).await;
    }

    assert_eq!(pc.stats().connections, 2);
}
