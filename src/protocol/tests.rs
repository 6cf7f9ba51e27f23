// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use futures::SinkExt;

use crate::config::{EngineConfig, Role};
use crate::core::codec::PacketCodec;
use crate::core::packet::{prefix_id, Packet, PacketType};
use crate::error::TunnelError;
use crate::protocol::correlator::ResponsePacket;
use crate::protocol::{duplexer, session, ConnectionHandle, Dispatcher, EngineContext};
use crate::utils::Metrics;

fn engine() -> (EngineContext, mpsc::Receiver<Packet>) {
    let (outbox, rx) = duplexer::channel(64);
    let engine = EngineConfig {
        request_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let ctx = EngineContext::new(
        outbox,
        &engine,
        Arc::new(Metrics::new()),
        CancellationToken::new(),
    );
    (ctx, rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<Packet>) -> Packet {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame expected")
        .expect("queue open")
}

async fn next_response(rx: &mut mpsc::Receiver<Packet>) -> ResponsePacket {
    let packet = next_frame(rx).await;
    assert_eq!(packet.packet_type, PacketType::Response);
    ResponsePacket::from_payload(&packet.payload).unwrap()
}

fn init_proxy(request_id: u32, body: &str) -> Packet {
    Packet::new(PacketType::InitProxy, prefix_id(request_id, body.as_bytes()))
}

#[tokio::test]
async fn init_proxy_with_four_fields_is_rejected() {
    let (ctx, mut rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Server);

    dispatcher
        .dispatch(init_proxy(5, "localhost:8080:localhost:9090"))
        .await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.request_id, 5);
    assert!(!response.success);
    assert!(response.message.contains("invalid payload format"));
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn init_proxy_dial_failure_registers_nothing() {
    let (ctx, mut rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Server);

    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    dispatcher
        .dispatch(init_proxy(
            1,
            &format!("localhost:8080:127.0.0.1:{closed_port}:9"),
        ))
        .await;

    let response = next_response(&mut rx).await;
    assert!(!response.success);
    assert!(response.message.starts_with("failed to dial"));
    assert!(!ctx.registry.contains(9));
}

#[tokio::test]
async fn init_proxy_success_then_data_and_close() {
    let (ctx, mut rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Server);

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = target.local_addr().unwrap().port();

    dispatcher
        .dispatch(init_proxy(3, &format!("localhost:8080:127.0.0.1:{port}:77")))
        .await;
    let (mut socket, _) = target.accept().await.unwrap();

    let response = next_response(&mut rx).await;
    assert!(response.success);
    assert_eq!(response.message, "proxy initialized successfully");
    assert!(ctx.registry.contains(77));

    dispatcher.dispatch(Packet::data(77, b"hello")).await;
    let mut buf = [0u8; 5];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    socket.write_all(b"back").await.unwrap();
    let data = next_frame(&mut rx).await;
    assert_eq!(data, Packet::data(77, b"back"));

    dispatcher.dispatch(Packet::close_port(77)).await;
    assert!(!ctx.registry.contains(77));

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn duplicate_connection_id_is_refused() {
    let (ctx, mut rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Server);
    let (existing, _peer) = tokio::io::duplex(8);
    ctx.registry
        .register(4, ConnectionHandle::new(existing))
        .unwrap();

    dispatcher
        .dispatch(init_proxy(8, "localhost:1:127.0.0.1:1:4"))
        .await;

    let response = next_response(&mut rx).await;
    assert!(!response.success);
    assert!(response.message.contains("already registered"));
}

#[tokio::test]
async fn data_frames_reach_only_their_connection() {
    let (ctx, _rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Client);

    let (a_local, mut a_peer) = tokio::io::duplex(1024);
    let (b_local, mut b_peer) = tokio::io::duplex(1024);
    ctx.registry.register(1, ConnectionHandle::new(a_local)).unwrap();
    ctx.registry.register(2, ConnectionHandle::new(b_local)).unwrap();

    let mut expect_a = Vec::new();
    let mut expect_b = Vec::new();
    for i in 0..50u8 {
        let (id, expect) = if i % 3 == 0 {
            (2, &mut expect_b)
        } else {
            (1, &mut expect_a)
        };
        let chunk = [i, i.wrapping_mul(7)];
        expect.extend_from_slice(&chunk);
        dispatcher.dispatch(Packet::data(id, &chunk)).await;
    }

    ctx.registry.remove(1);
    ctx.registry.remove(2);

    let mut got_a = Vec::new();
    let mut got_b = Vec::new();
    a_peer.read_to_end(&mut got_a).await.unwrap();
    b_peer.read_to_end(&mut got_b).await.unwrap();
    assert_eq!(got_a, expect_a);
    assert_eq!(got_b, expect_b);
}

#[tokio::test]
async fn unroutable_frames_are_ignored() {
    let (ctx, mut rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Server);
    let (local, _peer) = tokio::io::duplex(64);
    ctx.registry.register(10, ConnectionHandle::new(local)).unwrap();

    dispatcher.dispatch(Packet::data(999, b"lost")).await;
    dispatcher.dispatch(Packet::new(PacketType::Data, vec![0, 1])).await;
    dispatcher.dispatch(Packet::new(PacketType::ClosePort, b"ten".to_vec())).await;
    dispatcher.dispatch(Packet::close_port(11)).await;
    dispatcher.dispatch(Packet::new(PacketType::Unknown(42), b"future".to_vec())).await;
    dispatcher.dispatch(Packet::new(PacketType::Response, b"garbage".to_vec())).await;
    dispatcher.dispatch(Packet::hello()).await;

    assert!(ctx.registry.contains(10));
    assert!(rx.try_recv().is_err());
    assert_eq!(ctx.metrics.snapshot().invalid_frames, 4);
}

#[tokio::test]
async fn client_role_rejects_init_proxy() {
    let (ctx, mut rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Client);

    dispatcher
        .dispatch(init_proxy(6, "localhost:1:localhost:2:3"))
        .await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.request_id, 6);
    assert!(!response.success);
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn forwarder_sends_data_then_close_on_eof() {
    let (ctx, mut rx) = engine();
    let (writer, _writer_peer) = tokio::io::duplex(64);
    let (reader, mut reader_peer) = tokio::io::duplex(64);
    let handle = ConnectionHandle::new(writer);
    let closed = handle.closed();
    ctx.registry.register(21, handle).unwrap();

    let task = tokio::spawn(session::forward_connection(ctx.clone(), 21, reader, closed));

    reader_peer.write_all(b"abc").await.unwrap();
    assert_eq!(next_frame(&mut rx).await, Packet::data(21, b"abc"));

    drop(reader_peer);
    assert_eq!(next_frame(&mut rx).await, Packet::close_port(21));
    task.await.unwrap();
    assert!(!ctx.registry.contains(21));
}

#[tokio::test]
async fn forwarder_releases_connection_when_queue_is_gone() {
    let (ctx, rx) = engine();
    let (writer, _writer_peer) = tokio::io::duplex(64);
    let (reader, mut reader_peer) = tokio::io::duplex(64);
    let handle = ConnectionHandle::new(writer);
    let closed = handle.closed();
    ctx.registry.register(23, handle.clone()).unwrap();
    drop(rx);

    let task = tokio::spawn(session::forward_connection(ctx.clone(), 23, reader, closed));
    reader_peer.write_all(b"stranded").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(!ctx.registry.contains(23));
    assert!(handle.is_closed());
    assert_eq!(ctx.metrics.connections_active(), 0);
}

#[tokio::test]
async fn forwarder_stops_quietly_when_peer_closes() {
    let (ctx, mut rx) = engine();
    let (writer, _writer_peer) = tokio::io::duplex(64);
    let (reader, _reader_peer) = tokio::io::duplex(64);
    let handle = ConnectionHandle::new(writer);
    let closed = handle.closed();
    ctx.registry.register(22, handle).unwrap();

    let task = tokio::spawn(session::forward_connection(ctx.clone(), 22, reader, closed));
    ctx.registry.remove(22);

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(rx.try_recv().is_err(), "no ClosePort echoed back");
}

#[tokio::test]
async fn run_fails_on_truncated_frame() {
    let (ctx, _rx) = engine();
    let dispatcher = Dispatcher::new(ctx, Role::Client);
    let (mut tx, rx_stream) = tokio::io::duplex(64);

    tx.write_all(&[2, 0, 10, 0, 0]).await.unwrap();
    drop(tx);

    let err = dispatcher
        .run(FramedRead::new(rx_stream, PacketCodec))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::TruncatedFrame { expected: 13, received: 5 }));
}

#[tokio::test]
async fn run_reports_transport_eof_and_honours_shutdown() {
    let (ctx, _rx) = engine();
    let dispatcher = Dispatcher::new(ctx.clone(), Role::Client);

    let (tx, rx_stream) = tokio::io::duplex(64);
    let mut sink = FramedWrite::new(tx, PacketCodec);
    sink.send(Packet::hello()).await.unwrap();
    drop(sink);
    let err = dispatcher
        .run(FramedRead::new(rx_stream, PacketCodec))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::TransportError(_)));
    assert_eq!(ctx.metrics.snapshot().frames_received, 1);

    let (_tx, idle) = tokio::io::duplex(64);
    ctx.shutdown.cancel();
    dispatcher
        .run(FramedRead::new(idle, PacketCodec))
        .await
        .unwrap();
}
