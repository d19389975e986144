//! Session handshake.
//!
//! The client opens with a `Handshake` packet whose data is a small JSON
//! document; the server answers with `HandshakeAck` carrying the negotiated
//! route-code table, its version, the session id and the heartbeat interval.
//!
//! ```text
//! client                                   server
//!   | -- Handshake {clientVersion, ...} -->   |
//!   | <-- HandshakeAck {serverVersion, ...} -- |
//! ```
//!
//! Handshake state is per session: nothing here is global, so concurrent
//! handshakes cannot observe each other.

use crate::core::packet::{Packet, PacketKind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::RouteCodes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, instrument};

/// Client → server handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub want_route_compression: bool,
    /// Routes the client cares about; empty means "all".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_routes: Vec<String>,
}

impl HandshakeRequest {
    pub fn new(client_version: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            ..Self::default()
        }
    }

    pub fn with_route_compression(mut self, routes: Vec<String>) -> Self {
        self.want_route_compression = true;
        self.client_routes = routes;
        self
    }

    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(PacketKind::Handshake, serde_json::to_vec(self)?))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.kind != PacketKind::Handshake {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_EXPECTED_HANDSHAKE.into(),
            ));
        }
        if packet.data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(&packet.data)
            .map_err(|e| ProtocolError::HandshakeError(format!("malformed handshake: {e}")))
    }
}

/// Server → client handshake acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub server_version: String,
    pub session_id: u64,
    #[serde(default)]
    pub route_codes: BTreeMap<u16, String>,
    /// Milliseconds.
    pub heartbeat_interval: u64,
}

impl HandshakeAck {
    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(
            PacketKind::HandshakeAck,
            serde_json::to_vec(self)?,
        ))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.kind != PacketKind::HandshakeAck {
            return Err(ProtocolError::HandshakeError(format!(
                "expected HandshakeAck, got {}",
                packet.kind.name()
            )));
        }
        Ok(serde_json::from_slice(&packet.data)?)
    }

    pub fn codes(&self) -> RouteCodes {
        RouteCodes::from_table(self.route_codes.clone())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// Server-side negotiation parameters, fixed for the lifetime of a node.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub server_version: String,
    pub heartbeat_interval: Duration,
    pub route_compression: bool,
}

impl ServerHandshake {
    /// Answer a client handshake for session `session_id`.
    ///
    /// `routes` is the router content at the time of the handshake; the
    /// returned table is what this session uses for compressed routes.
    #[instrument(skip(self, request, routes), fields(client_version = %request.client_version))]
    pub fn respond<I>(
        &self,
        request: &HandshakeRequest,
        session_id: u64,
        routes: I,
    ) -> Result<(RouteCodes, HandshakeAck)>
    where
        I: IntoIterator<Item = String>,
    {
        check_version(&self.server_version, &request.client_version)?;

        let codes = if self.route_compression && request.want_route_compression {
            if request.client_routes.is_empty() {
                RouteCodes::from_routes(routes)
            } else {
                let wanted: HashSet<&str> =
                    request.client_routes.iter().map(String::as_str).collect();
                RouteCodes::from_routes(routes.into_iter().filter(|r| wanted.contains(r.as_str())))
            }
        } else {
            RouteCodes::new()
        };

        debug!(session_id, route_codes = codes.len(), "Handshake accepted");

        let ack = HandshakeAck {
            server_version: self.server_version.clone(),
            session_id,
            route_codes: codes.table().clone(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
        };
        Ok((codes, ack))
    }
}

/// Reject clients whose major version differs from the server's.
///
/// Versions that are empty or not semver-shaped are accepted as-is.
pub fn check_version(server: &str, client: &str) -> Result<()> {
    match (major_version(server), major_version(client)) {
        (Some(s), Some(c)) if s != c => Err(ProtocolError::VersionMismatch {
            server: server.to_string(),
            client: client.to_string(),
        }),
        _ => Ok(()),
    }
}

fn major_version(version: &str) -> Option<u64> {
    let version = version.trim().trim_start_matches('v');
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    // Require at least "major.minor" to count as semver-shaped.
    parts.next()?.parse::<u64>().ok()?;
    Some(major)
}
