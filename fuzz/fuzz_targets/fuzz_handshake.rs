#![no_main]

use cluster_dispatch::protocol::handshake::{HandshakeAck, HandshakeRequest};
use cluster_dispatch::{Packet, PacketKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Handshake bodies are JSON; malformed input must fail cleanly
    let _ = HandshakeRequest::from_packet(&Packet::new(PacketKind::Handshake, data.to_vec()));
    let _ = HandshakeAck::from_packet(&Packet::new(PacketKind::HandshakeAck, data.to_vec()));
});
