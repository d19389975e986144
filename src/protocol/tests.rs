// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::packet::{Packet, PacketKind};
use crate::error::ProtocolError;
use crate::protocol::handshake::*;
use crate::protocol::message::{self, Message};
use bytes::Bytes;
use std::time::Duration;

fn server(route_compression: bool) -> ServerHandshake {
    ServerHandshake {
        server_version: "1.4.0".into(),
        heartbeat_interval: Duration::from_secs(10),
        route_compression,
    }
}

fn routes() -> Vec<String> {
    vec![
        "slots.spin".to_string(),
        "chat.say".to_string(),
        "slots.login".to_string(),
    ]
}

#[test]
fn test_handshake_flow_with_route_compression() {
    // Client side
    let request = HandshakeRequest::new("1.2.0").with_route_compression(Vec::new());
    let packet = request.to_packet().unwrap();
    assert_eq!(packet.kind, PacketKind::Handshake);

    // Server side
    let received = HandshakeRequest::from_packet(&packet).unwrap();
    assert_eq!(received, request);
    let (codes, ack) = server(true).respond(&received, 42, routes()).unwrap();

    // Codes are assigned in lexical route order, starting at 1
    assert_eq!(codes.code("chat.say"), Some(1));
    assert_eq!(codes.code("slots.login"), Some(2));
    assert_eq!(codes.code("slots.spin"), Some(3));

    // Client reads the ack back and ends up with the same table
    let ack_packet = ack.to_packet().unwrap();
    let ack = HandshakeAck::from_packet(&ack_packet).unwrap();
    assert_eq!(ack.session_id, 42);
    assert_eq!(ack.server_version, "1.4.0");
    assert_eq!(ack.heartbeat(), Duration::from_secs(10));
    assert_eq!(ack.codes(), codes);

    // Both sides encode and decode with their own copy of the table
    let msg = Message::request(1, "slots.spin", &b"bet"[..]);
    let wire = message::encode(&msg, Some(&ack.codes())).unwrap();
    assert_eq!(message::decode(wire, Some(&codes)).unwrap(), msg);
}

#[test]
fn test_handshake_without_compression() {
    let request = HandshakeRequest::new("1.0.0");
    let (codes, ack) = server(true).respond(&request, 1, routes()).unwrap();
    assert!(codes.is_empty());
    assert!(ack.route_codes.is_empty());

    // Server refuses compression even when the client asks
    let request = HandshakeRequest::new("1.0.0").with_route_compression(Vec::new());
    let (codes, _) = server(false).respond(&request, 2, routes()).unwrap();
    assert!(codes.is_empty());
}

#[test]
fn test_client_routes_filter() {
    let request = HandshakeRequest::new("1.0.0")
        .with_route_compression(vec!["slots.spin".into(), "unknown.route".into()]);
    let (codes, ack) = server(true).respond(&request, 3, routes()).unwrap();

    assert_eq!(codes.len(), 1);
    assert_eq!(codes.code("slots.spin"), Some(1));
    assert_eq!(codes.code("unknown.route"), None);
    assert_eq!(ack.route_codes.get(&1).map(String::as_str), Some("slots.spin"));
}

#[test]
fn test_version_mismatch_rejected() {
    let request = HandshakeRequest::new("2.0.0");
    match server(false).respond(&request, 4, routes()) {
        Err(ProtocolError::VersionMismatch { server, client }) => {
            assert_eq!(server, "1.4.0");
            assert_eq!(client, "2.0.0");
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }

    assert!(check_version("1.4.0", "v1.0.3").is_ok());
    assert!(check_version("1.4.0", "").is_ok());
    assert!(check_version("1.4.0", "nightly").is_ok());
    assert!(check_version("0.9.0", "1.0.0").is_err());
}

#[test]
fn test_empty_handshake_uses_defaults() {
    let packet = Packet::new(PacketKind::Handshake, Bytes::new());
    let request = HandshakeRequest::from_packet(&packet).unwrap();
    assert_eq!(request, HandshakeRequest::default());
    assert!(!request.want_route_compression);
}

#[test]
fn test_handshake_wire_format_is_camel_case_json() {
    let packet = HandshakeRequest::new("1.0.0")
        .with_route_compression(vec!["a.b".into()])
        .to_packet()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&packet.data).unwrap();
    assert_eq!(json["clientVersion"], "1.0.0");
    assert_eq!(json["wantRouteCompression"], true);
    assert_eq!(json["clientRoutes"][0], "a.b");

    // Unknown fields from newer clients are ignored
    let packet = Packet::new(
        PacketKind::Handshake,
        &br#"{"clientVersion":"1.1.0","platform":"ios"}"#[..],
    );
    assert_eq!(
        HandshakeRequest::from_packet(&packet).unwrap().client_version,
        "1.1.0"
    );
}

#[test]
fn test_wrong_packet_kind_rejected() {
    let data = Packet::new(PacketKind::Data, &b"{}"[..]);
    assert!(matches!(
        HandshakeRequest::from_packet(&data),
        Err(ProtocolError::HandshakeError(_))
    ));

    let request = HandshakeRequest::new("1.0.0").to_packet().unwrap();
    assert!(matches!(
        HandshakeAck::from_packet(&request),
        Err(ProtocolError::HandshakeError(_))
    ));
}

#[test]
fn test_malformed_handshake_json() {
    let packet = Packet::new(PacketKind::Handshake, &b"{not json"[..]);
    match HandshakeRequest::from_packet(&packet) {
        Err(ProtocolError::HandshakeError(msg)) => assert!(msg.starts_with("malformed handshake")),
        other => panic!("expected handshake error, got {other:?}"),
    }
}

#[test]
fn test_concurrent_handshakes_are_independent() {
    let server = server(true);
    let a = HandshakeRequest::new("1.0.0").with_route_compression(vec!["chat.say".into()]);
    let b = HandshakeRequest::new("1.0.0").with_route_compression(Vec::new());

    let (codes_a, ack_a) = server.respond(&a, 10, routes()).unwrap();
    let (codes_b, ack_b) = server.respond(&b, 11, routes()).unwrap();

    assert_eq!(codes_a.len(), 1);
    assert_eq!(codes_b.len(), 3);
    assert_ne!(ack_a.session_id, ack_b.session_id);
}
