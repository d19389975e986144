//! End-to-end session scenarios: a node and its clients talking over the
//! in-memory transport (and TCP / Unix sockets where noted).

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::Bytes;
use cluster_dispatch::client::{Client, ClientOptions, Inbound};
use cluster_dispatch::config::{NodeConfig, OverflowPolicy};
use cluster_dispatch::core::codec::PacketCodec;
use cluster_dispatch::core::packet::{Packet, PacketKind};
use cluster_dispatch::error::{ErrorKind, ProtocolError};
use cluster_dispatch::node::{Node, NodeState};
use cluster_dispatch::protocol::message::{Message, MessageType};
use cluster_dispatch::service::{FnService, HandlerError};
use cluster_dispatch::transport::memory::MemoryTransport;
use cluster_dispatch::transport::Transport;
use futures::{SinkExt, StreamExt};
use serial_test::serial;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead};

struct Harness {
    node: Node,
    transport: MemoryTransport,
    addr: String,
}

impl Harness {
    async fn start<F>(name: &str, tweak: F, services: Vec<FnService>) -> Self
    where
        F: FnOnce(&mut NodeConfig),
    {
        let addr = format!("memory://{name}");
        let config = NodeConfig::default_with_overrides(|c| {
            c.server.listen_address = addr.clone();
            tweak(c);
        });
        let node = Node::configure(config).unwrap();
        for service in services {
            node.add_service(service).unwrap();
        }
        let transport = MemoryTransport::new();
        node.boot_with(&transport).await.unwrap();
        Self {
            node,
            transport,
            addr,
        }
    }

    async fn client(&self) -> Client {
        self.client_with(ClientOptions::default()).await.unwrap()
    }

    async fn client_with(&self, options: ClientOptions) -> cluster_dispatch::Result<Client> {
        Client::connect_with(&self.transport, &self.addr, options).await
    }

    async fn stop(self) {
        self.node.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}

fn slots() -> FnService {
    FnService::new("slots").method("login", |_ctx, _data| async {
        Ok(Bytes::from_static(b"ok"))
    })
}

fn echo() -> FnService {
    FnService::new("echo").method("say", |_ctx, data| async move { Ok(data) })
}

/// Read until the node kicks us, returning the messages seen on the way.
async fn until_kick(client: &mut Client) -> (Vec<Message>, String) {
    let mut messages = Vec::new();
    loop {
        match client.recv().await {
            Ok(Inbound::Message(msg)) => messages.push(msg),
            Ok(Inbound::Heartbeat) => {}
            Ok(Inbound::Kick(reason)) => return (messages, reason),
            Err(e) => panic!("connection ended without a kick: {e}"),
        }
    }
}

#[tokio::test]
async fn test_request_response() {
    let h = Harness::start("s3", |_| {}, vec![slots()]).await;
    let mut client = h.client().await;

    let response = client
        .call(Message::request(7, "slots.login", Bytes::new()))
        .await
        .unwrap();
    assert_eq!(response.kind, MessageType::Response);
    assert_eq!(response.id, 7);
    assert_eq!(&response.data[..], b"ok");
    assert!(!response.error);

    h.stop().await;
}

#[tokio::test]
async fn test_no_route_keeps_session_open() {
    let h = Harness::start("s4", |_| {}, vec![slots()]).await;
    let mut client = h.client().await;

    let response = client
        .call(Message::request(9, "does.not.exist", Bytes::new()))
        .await
        .unwrap();
    assert_eq!(response.id, 9);
    assert!(response.error);
    assert_eq!(&response.data[..], b"NoRoute: does.not.exist");

    // The same session still serves requests
    let response = client
        .call(Message::request(10, "slots.login", Bytes::new()))
        .await
        .unwrap();
    assert_eq!(&response.data[..], b"ok");
    assert_eq!(h.node.session_count(), 1);
    assert_eq!(h.node.metrics().routing_misses, 1);

    h.stop().await;
}

#[tokio::test]
async fn test_unknown_packet_kind_is_protocol_violation() {
    let h = Harness::start("s5", |_| {}, vec![slots()]).await;
    let mut conn = h.transport.connect(&h.addr).await.unwrap();
    conn.write_all(&[0xEE, 0x00, 0x00, 0x00]).await.unwrap();

    let mut frames = FramedRead::new(conn, PacketCodec);
    let kick = frames.next().await.unwrap().unwrap();
    assert_eq!(kick.kind, PacketKind::Kick);
    let reason = String::from_utf8(kick.data.to_vec()).unwrap();
    assert!(reason.starts_with("ProtocolViolation"), "reason: {reason}");

    // Nothing follows the kick
    assert!(frames.next().await.is_none());
    h.stop().await;
}

#[tokio::test]
async fn test_unexpected_packet_kind_after_handshake() {
    let h = Harness::start("s5-ready", |_| {}, vec![slots()]).await;
    let mut client = h.client().await;

    client
        .send_packet(Packet::new(PacketKind::HandshakeAck, Bytes::new()))
        .await
        .unwrap();
    let (_, reason) = until_kick(&mut client).await;
    assert!(reason.starts_with("ProtocolViolation"), "reason: {reason}");

    h.stop().await;
}

#[tokio::test]
async fn test_heartbeat_timeout() {
    let h = Harness::start(
        "s6",
        |c| c.session.heartbeat_interval = Duration::from_millis(50),
        vec![slots()],
    )
    .await;
    let mut client = h.client().await;
    assert_eq!(client.ack().heartbeat(), Duration::from_millis(50));

    // Stay silent; the node keeps probing with heartbeats, then gives up
    let started = tokio::time::Instant::now();
    let (_, reason) = until_kick(&mut client).await;
    assert_eq!(reason, "HeartbeatTimeout");
    assert!(started.elapsed() >= Duration::from_millis(140));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.node.metrics().heartbeat_timeouts, 1);
    assert_eq!(h.node.session_count(), 0);
    h.stop().await;
}

#[tokio::test]
async fn test_heartbeats_keep_session_alive() {
    let h = Harness::start(
        "s6-alive",
        |c| c.session.heartbeat_interval = Duration::from_millis(50),
        vec![echo()],
    )
    .await;
    let mut client = h.client().await;

    for _ in 0..15 {
        client.heartbeat().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let reply = client.request("echo.say", Bytes::from_static(b"still here")).await;
    assert_eq!(&reply.unwrap()[..], b"still here");

    h.stop().await;
}

#[tokio::test]
async fn test_backpressure_closes_session() {
    let burst = FnService::new("game").method("burst", |ctx, _data| async move {
        for i in 0u8..3 {
            ctx.push("game.tick", vec![i]).await?;
        }
        Ok::<_, HandlerError>(Bytes::new())
    });
    let h = Harness::start(
        "s7",
        |c| {
            c.session.outbound_queue_size = 2;
            c.session.outbound_overflow = OverflowPolicy::CloseSession;
        },
        vec![burst],
    )
    .await;
    let mut client = h.client().await;

    client
        .send(&Message::request(1, "game.burst", Bytes::new()))
        .await
        .unwrap();
    let (messages, reason) = until_kick(&mut client).await;

    assert_eq!(reason, "Backpressure");
    let pushes = messages
        .iter()
        .filter(|m| m.kind == MessageType::Push)
        .count();
    assert_eq!(pushes, 2, "both queued pushes go out before the kick");
    assert!(messages.iter().all(|m| m.kind == MessageType::Push));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.node.metrics().backpressure_closes, 1);
    h.stop().await;
}

#[tokio::test]
async fn test_drop_oldest_keeps_session_open() {
    let burst = FnService::new("game").method("burst", |ctx, _data| async move {
        for i in 0u8..5 {
            ctx.push("game.tick", vec![i]).await?;
        }
        Ok::<_, HandlerError>(Bytes::from_static(b"done"))
    });
    let h = Harness::start(
        "drop-oldest",
        |c| {
            c.session.outbound_queue_size = 2;
            c.session.outbound_overflow = OverflowPolicy::DropOldest;
        },
        vec![burst],
    )
    .await;
    let mut client = h.client().await;

    let reply = client.request("game.burst", Bytes::new()).await.unwrap();
    assert_eq!(&reply[..], b"done");

    // Whatever pushes survived arrive in order and end with the newest
    let mut ticks = Vec::new();
    while let Some(Inbound::Message(msg)) = recv_now(&mut client).await {
        assert_eq!(msg.route, "game.tick");
        ticks.push(msg.data[0]);
    }
    assert!(ticks.windows(2).all(|w| w[0] < w[1]));
    assert!(h.node.metrics().messages_dropped > 0);
    assert_eq!(h.node.session_count(), 1);

    h.stop().await;
}

/// Next inbound item if one is already buffered or arrives promptly.
async fn recv_now(client: &mut Client) -> Option<Inbound> {
    tokio::time::timeout(Duration::from_millis(50), client.recv())
        .await
        .ok()
        .and_then(Result::ok)
}

#[tokio::test]
async fn test_handshake_timeout() {
    let h = Harness::start(
        "hs-timeout",
        |c| c.server.handshake_timeout = Duration::from_millis(50),
        vec![slots()],
    )
    .await;
    let conn = h.transport.connect(&h.addr).await.unwrap();

    let mut frames = FramedRead::new(conn, PacketCodec);
    let kick = frames.next().await.unwrap().unwrap();
    assert_eq!(kick, Packet::kick("HandshakeTimeout"));
    h.stop().await;
}

#[tokio::test]
async fn test_first_packet_must_be_handshake() {
    let h = Harness::start("hs-first", |_| {}, vec![slots()]).await;
    let conn = h.transport.connect(&h.addr).await.unwrap();
    let mut framed = Framed::new(conn, PacketCodec);

    framed.send(Packet::heartbeat()).await.unwrap();
    let kick = framed.next().await.unwrap().unwrap();
    assert_eq!(kick.kind, PacketKind::Kick);
    assert!(String::from_utf8_lossy(&kick.data).starts_with("ProtocolViolation"));
    h.stop().await;
}

#[tokio::test]
async fn test_version_mismatch_kicks_before_ack() {
    let h = Harness::start(
        "hs-version",
        |c| c.server.server_version = "1.0.0".into(),
        vec![slots()],
    )
    .await;

    let result = h
        .client_with(ClientOptions {
            client_version: "2.3.0".into(),
            ..ClientOptions::default()
        })
        .await;
    match result {
        Err(ProtocolError::Kicked(reason)) => {
            assert!(reason.starts_with("ProtocolViolation"), "reason: {reason}");
            assert!(reason.contains("Version mismatch"));
        }
        other => panic!("expected a kick, got {other:?}"),
    }
    assert_eq!(h.node.metrics().handshakes_failed, 1);
    h.stop().await;
}

#[tokio::test]
async fn test_route_compression_end_to_end() {
    let pusher = FnService::new("room").method("join", |ctx, data| async move {
        ctx.push("room.joined", data).await?;
        Ok::<_, HandlerError>(Bytes::from_static(b"welcome"))
    });
    let h = Harness::start("compress", |_| {}, vec![pusher, slots()]).await;

    let mut client = h
        .client_with(ClientOptions {
            route_compression: true,
            client_routes: vec!["room.join".into(), "room.joined".into()],
            ..ClientOptions::default()
        })
        .await
        .unwrap();
    // Only routes the node serves get codes
    assert_eq!(client.route_codes().len(), 1);
    assert!(client.route_codes().code("room.join").is_some());

    let reply = client.request("room.join", Bytes::from_static(b"alice")).await;
    assert_eq!(&reply.unwrap()[..], b"welcome");
    match client.recv().await.unwrap() {
        Inbound::Message(push) => {
            assert_eq!(push.kind, MessageType::Push);
            assert_eq!(push.route, "room.joined");
            assert_eq!(&push.data[..], b"alice");
        }
        other => panic!("expected push, got {other:?}"),
    }

    let session = h.node.session(client.session_id()).unwrap();
    assert_eq!(session.route_codes().len(), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_handler_error_and_notify() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let svc = FnService::new("log")
        .method("write", move |_ctx, data: Bytes| {
            let tx = tx.clone();
            async move {
                tx.send(data).map_err(|_| HandlerError::new("receiver gone"))?;
                Ok::<_, HandlerError>(Bytes::new())
            }
        })
        .method("fail", |_ctx, _data| async {
            Err(HandlerError::new("disk full"))
        });
    let h = Harness::start("notify", |_| {}, vec![svc]).await;
    let mut client = h.client().await;

    client.notify("log.write", Bytes::from_static(b"line 1")).await.unwrap();
    let written = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert_eq!(&written.unwrap().unwrap()[..], b"line 1");

    match client.request("log.fail", Bytes::new()).await {
        Err(ProtocolError::Remote(err)) => {
            assert_eq!(err.kind, ErrorKind::Handler);
            assert_eq!(err.message, "disk full");
        }
        other => panic!("expected handler error, got {other:?}"),
    }

    // Notify never produces a Response, and unknown notify routes are dropped
    client.notify("log.nowhere", Bytes::new()).await.unwrap();
    assert!(recv_now(&mut client).await.is_none());
    assert_eq!(h.node.session_count(), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_client_only_message_types_are_ignored() {
    let h = Harness::start("client-types", |_| {}, vec![echo()]).await;
    let mut client = h.client().await;

    client.send(&Message::response(5, Bytes::new())).await.unwrap();
    client.send(&Message::push("echo.say", Bytes::new())).await.unwrap();

    let reply = client.request("echo.say", Bytes::from_static(b"x")).await;
    assert_eq!(&reply.unwrap()[..], b"x");
    h.stop().await;
}

#[tokio::test]
async fn test_duplicate_in_flight_id_is_protocol_violation() {
    let slow = FnService::new("slow").method("op", |_ctx, _data| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Bytes::new())
    });
    let h = Harness::start("dup-id", |_| {}, vec![slow]).await;
    let mut client = h.client().await;

    client.send(&Message::request(3, "slow.op", Bytes::new())).await.unwrap();
    client.send(&Message::request(3, "slow.op", Bytes::new())).await.unwrap();

    let (_, reason) = until_kick(&mut client).await;
    assert!(reason.starts_with("ProtocolViolation"), "reason: {reason}");
    assert!(reason.contains("already in flight"));
    h.stop().await;
}

#[tokio::test]
async fn test_kick_and_broadcast() {
    let h = Harness::start("kick", |_| {}, vec![echo()]).await;
    let mut a = h.client().await;
    let mut b = h.client().await;
    assert_ne!(a.session_id(), b.session_id());

    let report = h.node.broadcast("news.flash", Bytes::from_static(b"hello")).await;
    assert_eq!(report.delivered, 2);
    assert!(report.failed.is_empty());
    for client in [&mut a, &mut b] {
        match client.recv().await.unwrap() {
            Inbound::Message(msg) => {
                assert_eq!(msg.kind, MessageType::Notify);
                assert_eq!(msg.route, "news.flash");
            }
            other => panic!("expected notify, got {other:?}"),
        }
    }

    h.node.kick(a.session_id(), "maintenance").unwrap();
    let (_, reason) = until_kick(&mut a).await;
    assert_eq!(reason, "Kicked: maintenance");
    assert!(matches!(
        h.node.kick(9_999, "nobody"),
        Err(ProtocolError::SessionClosed)
    ));

    // The other session is unaffected
    let reply = b.request("echo.say", Bytes::from_static(b"ping")).await;
    assert_eq!(&reply.unwrap()[..], b"ping");
    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_kicks_sessions() {
    let h = Harness::start("shutdown", |_| {}, vec![echo()]).await;
    let mut client = h.client().await;
    let session = h.node.session(client.session_id()).unwrap();

    h.node.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(h.node.state(), NodeState::Stopped);
    assert_eq!(h.node.session_count(), 0);
    session.closed().await;

    let (_, reason) = until_kick(&mut client).await;
    assert_eq!(reason, "Shutdown");
    assert!(h.client_with(ClientOptions::default()).await.is_err());
}

#[tokio::test]
async fn test_connection_limit() {
    let h = Harness::start("limit", |c| c.server.max_connections = 1, vec![echo()]).await;
    let mut first = h.client().await;

    let second = h
        .client_with(ClientOptions {
            timeout: Duration::from_millis(500),
            ..ClientOptions::default()
        })
        .await;
    assert!(second.is_err());
    assert_eq!(h.node.metrics().sessions_rejected, 1);

    let reply = first.request("echo.say", Bytes::from_static(b"ok")).await;
    assert_eq!(&reply.unwrap()[..], b"ok");
    h.stop().await;
}

#[tokio::test]
#[serial]
async fn test_tcp_transport() {
    let config = NodeConfig::default_with_overrides(|c| {
        c.server.listen_address = "127.0.0.1:0".into();
    });
    let node = Node::configure(config).unwrap();
    node.add_service(slots()).unwrap();
    node.boot().await.unwrap();

    let addr = node.local_addr().unwrap().to_string();
    assert!(!addr.ends_with(":0"));

    let mut client = Client::connect(&addr).await.unwrap();
    let reply = client.request("slots.login", Bytes::new()).await.unwrap();
    assert_eq!(&reply[..], b"ok");
    client.close().await.unwrap();

    node.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_unix_socket_transport() {
    use cluster_dispatch::transport::local::UnixTransport;

    let path = std::env::temp_dir().join(format!("cluster-dispatch-{}.sock", std::process::id()));
    let path = path.to_string_lossy().into_owned();
    let config = NodeConfig::default_with_overrides(|c| c.server.listen_address = path.clone());
    let node = Node::configure(config).unwrap();
    node.add_service(echo()).unwrap();
    node.boot().await.unwrap();

    let mut client = Client::connect_with(&UnixTransport, &path, ClientOptions::default())
        .await
        .unwrap();
    let reply = client.request("echo.say", Bytes::from_static(b"local")).await;
    assert_eq!(&reply.unwrap()[..], b"local");

    node.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_memory_address_needs_explicit_transport() {
    let config =
        NodeConfig::default_with_overrides(|c| c.server.listen_address = "memory://x".into());
    let node = Node::configure(config).unwrap();
    assert!(matches!(node.boot().await, Err(ProtocolError::BindFailed(_))));
    assert_eq!(node.state(), NodeState::Configured);
}
