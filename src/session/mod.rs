//! # Sessions
//!
//! Per-connection state shared between the dispatcher, running handlers and
//! the node.
//!
//! ```text
//! Handshaking ──ack──▶ Ready ──close──▶ Closing ──drained──▶ Closed
//!      │                 │                 ▲
//!      └──────error──────┴──────error──────┘
//! ```
//!
//! A session is closed exactly once; later `close` calls are no-ops and the
//! first cause wins. Once `Closing` starts nothing new enters the outbound
//! queue; what is already queued drains within the close grace period.

pub mod outbound;

use crate::config::SessionConfig;
use crate::core::packet::{Packet, PacketKind, MAX_PACKET_DATA};
use crate::error::{ProtocolError, RemoteError, Result};
use crate::protocol::message::{self, Message, RouteCodes};
use crate::utils::Metrics;
use bytes::Bytes;
use futures::future::join_all;
use outbound::{OutboundQueue, PushOutcome};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Why a session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Malformed or unexpected input from the peer.
    ProtocolViolation(String),
    HeartbeatTimeout,
    HandshakeTimeout,
    /// The outbound queue overflowed under the `close_session` policy.
    Backpressure,
    TransportError(String),
    /// The peer closed the connection or sent a Kick.
    PeerClosed,
    Shutdown,
    /// Closed by the embedding program.
    Kicked(String),
}

impl CloseCause {
    pub fn name(&self) -> &'static str {
        match self {
            CloseCause::ProtocolViolation(_) => "ProtocolViolation",
            CloseCause::HeartbeatTimeout => "HeartbeatTimeout",
            CloseCause::HandshakeTimeout => "HandshakeTimeout",
            CloseCause::Backpressure => "Backpressure",
            CloseCause::TransportError(_) => "TransportError",
            CloseCause::PeerClosed => "PeerClosed",
            CloseCause::Shutdown => "Shutdown",
            CloseCause::Kicked(_) => "Kicked",
        }
    }

    /// Whether the peer is told why with a Kick packet.
    fn sends_kick(&self) -> bool {
        !matches!(
            self,
            CloseCause::TransportError(_) | CloseCause::PeerClosed
        )
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::ProtocolViolation(detail)
            | CloseCause::TransportError(detail)
            | CloseCause::Kicked(detail)
                if !detail.is_empty() =>
            {
                write!(f, "{}: {}", self.name(), detail)
            }
            _ => f.write_str(self.name()),
        }
    }
}

struct Negotiated {
    client_version: String,
    codes: Arc<RouteCodes>,
}

type Attr = Arc<dyn Any + Send + Sync>;

/// One client connection.
pub struct Session {
    id: u64,
    remote_addr: String,
    created: Instant,
    state: watch::Sender<SessionState>,
    cause: Mutex<Option<CloseCause>>,
    outbound: OutboundQueue,
    negotiated: OnceLock<Negotiated>,
    in_flight: Mutex<HashSet<u64>>,
    attrs: Mutex<HashMap<String, Attr>>,
    cancel: CancellationToken,
    force: CancellationToken,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("queued", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn new(
        id: u64,
        remote_addr: impl Into<String>,
        config: &SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Handshaking);
        Arc::new(Self {
            id,
            remote_addr: remote_addr.into(),
            created: Instant::now(),
            state,
            cause: Mutex::new(None),
            outbound: OutboundQueue::new(config.outbound_queue_size, config.outbound_overflow),
            negotiated: OnceLock::new(),
            in_flight: Mutex::new(HashSet::new()),
            attrs: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            metrics,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// True until `Closing` begins.
    pub fn is_open(&self) -> bool {
        self.state() < SessionState::Closing
    }

    pub fn close_cause(&self) -> Option<CloseCause> {
        lock(&self.cause).clone()
    }

    /// Version the client announced at handshake.
    pub fn client_version(&self) -> Option<&str> {
        self.negotiated.get().map(|n| n.client_version.as_str())
    }

    /// Route codes negotiated at handshake; empty before the handshake.
    pub fn route_codes(&self) -> Arc<RouteCodes> {
        self.negotiated
            .get()
            .map(|n| Arc::clone(&n.codes))
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Resolves once the session reaches `Closed`.
    pub async fn closed(&self) {
        self.wait_for(SessionState::Closed).await
    }

    pub(crate) async fn closing(&self) {
        self.wait_for(SessionState::Closing).await
    }

    async fn wait_for(&self, target: SessionState) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only ends on a match.
        let _ = rx.wait_for(|state| *state >= target).await;
    }

    /// Answer Request `id` with `data`.
    ///
    /// Fails with [`ProtocolError::AlreadyResponded`] if `id` is not an
    /// unanswered Request of this session.
    pub async fn respond(&self, id: u64, data: impl Into<Bytes>) -> Result<()> {
        self.answer(Message::response(id, data)).await
    }

    /// Answer Request `id` with an error Response.
    pub async fn respond_error(&self, id: u64, err: &RemoteError) -> Result<()> {
        self.answer(Message::error_response(id, err)).await
    }

    async fn answer(&self, response: Message) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::SessionClosed);
        }
        if !lock(&self.in_flight).remove(&response.id) {
            return Err(ProtocolError::AlreadyResponded(response.id));
        }
        self.send(&response).await
    }

    /// Send a Push to this session.
    pub async fn push(&self, route: &str, data: impl Into<Bytes>) -> Result<()> {
        self.send(&Message::push(route, data)).await
    }

    /// Send a Notify to this session.
    pub async fn notify(&self, route: &str, data: impl Into<Bytes>) -> Result<()> {
        self.send(&Message::notify(route, data)).await
    }

    /// Encode `msg` with this session's route codes and queue it.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let codes = self.route_codes();
        let data = message::encode(msg, Some(&codes))?;
        if data.len() > MAX_PACKET_DATA {
            return Err(ProtocolError::PayloadTooLarge(data.len()));
        }
        self.enqueue(Packet::new(PacketKind::Data, data)).await
    }

    /// Queue a raw packet, applying the overflow policy.
    pub(crate) async fn enqueue(&self, packet: Packet) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::SessionClosed);
        }
        match self.outbound.push(packet).await {
            PushOutcome::Queued => Ok(()),
            PushOutcome::DroppedOldest => {
                self.metrics.message_dropped();
                debug!(session_id = self.id, "Outbound queue full, dropped oldest");
                Ok(())
            }
            PushOutcome::DroppedNewest => {
                self.metrics.message_dropped();
                debug!(session_id = self.id, "Outbound queue full, dropped newest");
                Err(ProtocolError::Backpressure)
            }
            PushOutcome::Overflow => {
                self.metrics.backpressure_close();
                self.close(CloseCause::Backpressure);
                Err(ProtocolError::Backpressure)
            }
            PushOutcome::Closed => Err(ProtocolError::SessionClosed),
        }
    }

    /// Start closing. Returns `false` if the session was already closing.
    pub fn close(&self, cause: CloseCause) -> bool {
        // The queue closes inside the state transition so no packet can land
        // behind the kick.
        let kick = cause.sends_kick().then(|| Packet::kick(&cause.to_string()));
        let started = self.state.send_if_modified(|state| {
            if *state < SessionState::Closing {
                *state = SessionState::Closing;
                *lock(&self.cause) = Some(cause.clone());
                self.outbound.close_with(kick);
                true
            } else {
                false
            }
        });
        if !started {
            return false;
        }

        match &cause {
            CloseCause::PeerClosed | CloseCause::Shutdown | CloseCause::Kicked(_) => {
                info!(session_id = self.id, cause = %cause, "Session closing")
            }
            _ => warn!(session_id = self.id, cause = %cause, "Session closing"),
        }

        self.cancel.cancel();
        true
    }

    /// Stop draining and drop the connection as soon as possible.
    pub(crate) fn force_close(&self) {
        self.close(CloseCause::Shutdown);
        self.force.cancel();
    }

    /// Attach a value to the session under `key`, replacing any previous one.
    pub fn set_attr<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        lock(&self.attrs).insert(key.into(), Arc::new(value));
    }

    /// Value under `key`, if present and of type `T`.
    pub fn attr<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = lock(&self.attrs).get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_attr(&self, key: &str) -> bool {
        lock(&self.attrs).remove(key).is_some()
    }

    /// Track an inbound Request id until it is answered.
    pub(crate) fn begin_request(&self, id: u64) -> Result<()> {
        if lock(&self.in_flight).insert(id) {
            Ok(())
        } else {
            Err(ProtocolError::DuplicateRequest(id))
        }
    }

    pub(crate) fn mark_ready(&self, client_version: String, codes: RouteCodes) {
        let _ = self.negotiated.set(Negotiated {
            client_version,
            codes: Arc::new(codes),
        });
        self.state.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_closed(&self) {
        let previous = self.state.send_replace(SessionState::Closed);
        if previous != SessionState::Closed {
            self.metrics.session_closed();
            debug!(session_id = self.id, "Session closed");
        }
    }

    pub(crate) fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn force_token(&self) -> &CancellationToken {
        &self.force
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    /// Sessions that did not accept the message.
    pub failed: Vec<u64>,
}

/// Send the same Notify to every session in `sessions`.
///
/// A session that is closed or refuses the message does not affect delivery
/// to the others.
pub async fn notify_all<'a, I>(sessions: I, route: &str, data: Bytes) -> NotifyReport
where
    I: IntoIterator<Item = &'a Arc<Session>>,
{
    let sends = sessions.into_iter().map(|session| {
        let data = data.clone();
        async move { (session.id(), session.notify(route, data).await) }
    });

    let mut report = NotifyReport::default();
    for (id, outcome) in join_all(sends).await {
        match outcome {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                debug!(session_id = id, route, error = %e, "Notify not delivered");
                report.failed.push(id);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::OverflowPolicy;

    fn session(id: u64, queue: usize) -> Arc<Session> {
        let config = SessionConfig {
            outbound_queue_size: queue,
            outbound_overflow: OverflowPolicy::CloseSession,
            ..SessionConfig::default()
        };
        Session::new(id, "test", &config, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn respond_once_per_request() {
        let s = session(1, 8);
        s.mark_ready(String::new(), RouteCodes::new());
        s.begin_request(7).unwrap();

        s.respond(7, &b"ok"[..]).await.unwrap();
        assert!(matches!(
            s.respond(7, &b"again"[..]).await,
            Err(ProtocolError::AlreadyResponded(7))
        ));
        assert!(matches!(
            s.respond(8, &b"never asked"[..]).await,
            Err(ProtocolError::AlreadyResponded(8))
        ));
        assert_eq!(s.outbound().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id() {
        let s = session(1, 8);
        s.begin_request(3).unwrap();
        assert!(matches!(
            s.begin_request(3),
            Err(ProtocolError::DuplicateRequest(3))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_first_cause_wins() {
        let s = session(1, 8);
        assert!(s.close(CloseCause::HeartbeatTimeout));
        assert!(!s.close(CloseCause::Shutdown));
        assert_eq!(s.close_cause(), Some(CloseCause::HeartbeatTimeout));
        assert_eq!(s.state(), SessionState::Closing);
        assert!(s.cancel_token().is_cancelled());

        let kick = s.outbound().pop().await.unwrap();
        assert_eq!(kick.kind, PacketKind::Kick);
        assert_eq!(&kick.data[..], b"HeartbeatTimeout");
    }

    #[tokio::test]
    async fn nothing_enqueued_after_close() {
        let s = session(1, 8);
        s.mark_ready(String::new(), RouteCodes::new());
        s.begin_request(1).unwrap();
        s.close(CloseCause::PeerClosed);

        assert!(matches!(
            s.push("a.b", Bytes::new()).await,
            Err(ProtocolError::SessionClosed)
        ));
        assert!(matches!(
            s.respond(1, Bytes::new()).await,
            Err(ProtocolError::SessionClosed)
        ));
        assert!(s.outbound().pop().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn kick_is_last_even_with_concurrent_pushes() {
        let s = session(1, 1_000_000);
        s.mark_ready(String::new(), RouteCodes::new());

        let mut pushers = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            pushers.push(tokio::spawn(async move {
                while s.push("a.b", Bytes::new()).await.is_ok() {
                    tokio::task::yield_now().await;
                }
            }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(s.close(CloseCause::Kicked("maintenance".into())));
        for pusher in pushers {
            pusher.await.unwrap();
        }

        let mut last = None;
        while let Some(packet) = s.outbound().pop().await {
            last = Some(packet);
        }
        assert_eq!(last, Some(Packet::kick("Kicked: maintenance")));
    }

    #[tokio::test]
    async fn overflow_closes_with_backpressure() {
        let s = session(1, 2);
        s.mark_ready(String::new(), RouteCodes::new());
        s.push("a.b", Bytes::new()).await.unwrap();
        s.push("a.b", Bytes::new()).await.unwrap();
        assert!(matches!(
            s.push("a.b", Bytes::new()).await,
            Err(ProtocolError::Backpressure)
        ));
        assert_eq!(s.close_cause(), Some(CloseCause::Backpressure));
        // two pushes and the kick
        assert_eq!(s.outbound().len(), 3);
    }

    #[tokio::test]
    async fn compressed_routes_after_handshake() {
        let s = session(1, 8);
        s.mark_ready("1.0.0".into(), RouteCodes::from_routes(["chat.msg"]));
        assert_eq!(s.client_version(), Some("1.0.0"));
        s.push("chat.msg", &b"hi"[..]).await.unwrap();

        let packet = s.outbound().pop().await.unwrap();
        // flags, route code 1, payload
        assert_eq!(&packet.data[..], &[0x0B, 0x00, 0x01, b'h', b'i']);
        let msg = message::decode(packet.data, Some(&s.route_codes())).unwrap();
        assert_eq!(msg.route, "chat.msg");
    }

    #[test]
    fn attrs_are_typed() {
        let s = session(1, 8);
        s.set_attr("uid", 42u64);
        assert_eq!(s.attr::<u64>("uid").as_deref(), Some(&42));
        assert!(s.attr::<String>("uid").is_none());
        assert!(s.remove_attr("uid"));
        assert!(s.attr::<u64>("uid").is_none());
    }

    #[test]
    fn cause_display() {
        assert_eq!(
            CloseCause::ProtocolViolation("Unknown packet kind: 0xee".into()).to_string(),
            "ProtocolViolation: Unknown packet kind: 0xee"
        );
        assert_eq!(CloseCause::Backpressure.to_string(), "Backpressure");
    }

    #[tokio::test]
    async fn fan_out_reports_failures() {
        let a = session(1, 8);
        let b = session(2, 8);
        a.mark_ready(String::new(), RouteCodes::new());
        b.mark_ready(String::new(), RouteCodes::new());
        b.close(CloseCause::Shutdown);

        let report = notify_all([&a, &b], "room.say", Bytes::from_static(b"hi")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![2]);
    }
}
