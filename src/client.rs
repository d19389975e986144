//! # Client
//!
//! Minimal client side of the protocol: performs the handshake, then sends
//! Requests, Notifies and Heartbeats and reads what the node sends back.
//! Requests are answered in id order only under the serial policy, so
//! [`Client::request`] buffers anything it reads that is not its Response.

use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, PacketKind};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{HandshakeAck, HandshakeRequest};
use crate::protocol::message::{self, Message, MessageType, RouteCodes};
use crate::transport::tcp::TcpTransport;
use crate::transport::{BoxConnection, Transport};
use crate::utils::timeout::{with_timeout_error, CLIENT_TIMEOUT};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// Handshake parameters and per-operation timeout.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_version: String,
    pub route_compression: bool,
    /// Routes to ask codes for; empty asks for all.
    pub client_routes: Vec<String>,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_version: crate::config::SERVER_VERSION.to_string(),
            route_compression: false,
            client_routes: Vec::new(),
            timeout: CLIENT_TIMEOUT,
        }
    }
}

/// Something received from the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Message),
    Heartbeat,
    /// The node closed the session; carries the reason.
    Kick(String),
}

pub struct Client {
    framed: Framed<BoxConnection, PacketCodec>,
    ack: HandshakeAck,
    codes: RouteCodes,
    next_id: u64,
    timeout: Duration,
    pending: VecDeque<Inbound>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_id", &self.ack.session_id)
            .field("server_version", &self.ack.server_version)
            .field("route_codes", &self.codes.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect over TCP with default options.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with(&TcpTransport, addr, ClientOptions::default()).await
    }

    #[instrument(skip(transport, options))]
    pub async fn connect_with(
        transport: &dyn Transport,
        addr: &str,
        options: ClientOptions,
    ) -> Result<Self> {
        let conn = with_timeout_error(
            async { transport.connect(addr).await.map_err(ProtocolError::from) },
            options.timeout,
        )
        .await?;
        Self::handshake(conn, options).await
    }

    /// Run the handshake over an already open connection.
    pub async fn handshake(conn: BoxConnection, options: ClientOptions) -> Result<Self> {
        let mut framed = Framed::new(conn, PacketCodec);
        let mut request = HandshakeRequest::new(options.client_version.clone());
        if options.route_compression {
            request = request.with_route_compression(options.client_routes.clone());
        }
        framed.send(request.to_packet()?).await?;

        let packet = with_timeout_error(
            async {
                framed
                    .next()
                    .await
                    .ok_or(ProtocolError::ConnectionClosed)?
            },
            options.timeout,
        )
        .await?;
        if packet.kind == PacketKind::Kick {
            return Err(ProtocolError::Kicked(
                String::from_utf8_lossy(&packet.data).into_owned(),
            ));
        }
        let ack = HandshakeAck::from_packet(&packet)?;
        debug!(session_id = ack.session_id, server_version = %ack.server_version, "Handshake complete");

        Ok(Self {
            framed,
            codes: ack.codes(),
            ack,
            next_id: 1,
            timeout: options.timeout,
            pending: VecDeque::new(),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.ack.session_id
    }

    pub fn ack(&self) -> &HandshakeAck {
        &self.ack
    }

    pub fn route_codes(&self) -> &RouteCodes {
        &self.codes
    }

    pub async fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.framed.send(packet).await
    }

    /// Encode and send `msg`, compressing its route when a code was negotiated.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let data = message::encode(msg, Some(&self.codes))?;
        self.send_packet(Packet::new(PacketKind::Data, data)).await
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.send_packet(Packet::heartbeat()).await
    }

    pub async fn notify(&mut self, route: &str, data: impl Into<Bytes>) -> Result<()> {
        self.send(&Message::notify(route, data)).await
    }

    /// Send a Request and wait for its Response payload.
    ///
    /// An error Response becomes [`ProtocolError::Remote`].
    pub async fn request(&mut self, route: &str, data: impl Into<Bytes>) -> Result<Bytes> {
        let id = self.next_id;
        self.next_id += 1;
        let response = self.call(Message::request(id, route, data)).await?;
        match response.remote_error() {
            Some(err) => Err(ProtocolError::Remote(err)),
            None => Ok(response.data),
        }
    }

    /// Send `request` as is and return the matching Response message.
    pub async fn call(&mut self, request: Message) -> Result<Message> {
        let id = request.id;
        self.send(&request).await?;

        let buffered = self.pending.iter().position(
            |inbound| matches!(inbound, Inbound::Message(m) if m.kind == MessageType::Response && m.id == id),
        );
        if let Some(Inbound::Message(msg)) = buffered.and_then(|pos| self.pending.remove(pos)) {
            return Ok(msg);
        }

        let mut skipped = Vec::new();
        let outcome = loop {
            match self.read().await {
                Ok(Inbound::Message(msg)) if msg.kind == MessageType::Response && msg.id == id => {
                    break Ok(msg)
                }
                Ok(Inbound::Kick(reason)) => break Err(ProtocolError::Kicked(reason)),
                Ok(other) => skipped.push(other),
                Err(e) => break Err(e),
            }
        };
        // Keep arrival order for whoever calls `recv` next.
        for inbound in skipped.into_iter().rev() {
            self.pending.push_front(inbound);
        }
        outcome
    }

    /// Next packet from the node.
    pub async fn recv(&mut self) -> Result<Inbound> {
        match self.pending.pop_front() {
            Some(inbound) => Ok(inbound),
            None => self.read().await,
        }
    }

    async fn read(&mut self) -> Result<Inbound> {
        let framed = &mut self.framed;
        let packet = with_timeout_error(
            async { framed.next().await.ok_or(ProtocolError::ConnectionClosed)? },
            self.timeout,
        )
        .await?;

        match packet.kind {
            PacketKind::Data => Ok(Inbound::Message(message::decode(
                packet.data,
                Some(&self.codes),
            )?)),
            PacketKind::Heartbeat => Ok(Inbound::Heartbeat),
            PacketKind::Kick => Ok(Inbound::Kick(
                String::from_utf8_lossy(&packet.data).into_owned(),
            )),
            PacketKind::Handshake | PacketKind::HandshakeAck => Err(ProtocolError::HandshakeError(
                format!("unexpected {} after handshake", packet.kind.name()),
            )),
        }
    }

    /// Flush and shut down the connection.
    pub async fn close(mut self) -> Result<()> {
        self.framed.close().await
    }
}
