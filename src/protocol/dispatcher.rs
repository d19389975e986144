//! Per-session read → decode → route → invoke → write loop.
//!
//! Each connection gets one reader (this module's [`Dispatcher::run`]) and one
//! writer task draining the session's outbound queue. Handlers run either on
//! the session's serial lane, one at a time in arrival order, or on its
//! parallel lane, bounded by a per-session worker pool.

use crate::config::{Concurrency, DispatchConfig, NodeConfig, SessionConfig};
use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, PacketKind};
use crate::error::{constants, ErrorKind, ProtocolError, RemoteError, Result};
use crate::protocol::handshake::{HandshakeRequest, ServerHandshake};
use crate::protocol::message::{self, Message, MessageType};
use crate::protocol::router::{RouteEntry, Router};
use crate::service::{Context, HandlerResult};
use crate::session::{CloseCause, Session};
use crate::transport::BoxConnection;
use crate::utils::timeout::FORCE_CLOSE_WAIT;
use crate::utils::metrics::Timer;
use crate::utils::Metrics;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// A routed message waiting for its handler.
struct Job {
    entry: Arc<RouteEntry>,
    message: Message,
}

/// Drives sessions for one node.
#[derive(Debug)]
pub struct Dispatcher {
    router: Arc<Router>,
    handshake: ServerHandshake,
    handshake_timeout: Duration,
    session: SessionConfig,
    dispatch: DispatchConfig,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, config: &NodeConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            router,
            handshake: ServerHandshake {
                server_version: config.server.server_version.clone(),
                heartbeat_interval: config.session.heartbeat_interval,
                route_compression: config.session.route_compression,
            },
            handshake_timeout: config.server.handshake_timeout,
            session: config.session.clone(),
            dispatch: config.dispatch.clone(),
            metrics,
        }
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    /// Serve `session` over `conn` until it is closed.
    ///
    /// Returns once the session is `Closed`: the writer has drained or given
    /// up, and running handlers have finished or the close grace elapsed.
    #[instrument(skip_all, fields(session_id = session.id(), peer = %session.remote_addr()))]
    pub async fn run(&self, session: Arc<Session>, conn: BoxConnection) {
        let (reader, writer) = tokio::io::split(conn);
        let mut frames = FramedRead::new(reader, PacketCodec);
        let sink = FramedWrite::new(writer, PacketCodec);

        let writer = tokio::spawn(write_loop(
            Arc::clone(&session),
            sink,
            self.session.close_grace,
            Arc::clone(&self.metrics),
        ));

        let tracker = TaskTracker::new();
        let cause = {
            let lanes = Lanes::new(&session, &self.dispatch, &tracker, &self.metrics);
            self.read_loop(&session, &mut frames, &lanes).await
        };
        session.close(cause);
        tracker.close();

        let force = session.force_token();
        tokio::select! {
            _ = tracker.wait() => {}
            _ = tokio::time::sleep(self.session.close_grace) => {
                warn!(running = tracker.len(), "Handlers still running after close grace");
            }
            _ = force.cancelled() => {}
        }
        if let Err(e) = writer.await {
            error!(error = %e, "Session writer failed");
        }

        session.mark_closed();
    }

    async fn read_loop<R>(
        &self,
        session: &Arc<Session>,
        frames: &mut FramedRead<R, PacketCodec>,
        lanes: &Lanes,
    ) -> CloseCause
    where
        R: AsyncRead + Unpin,
    {
        if let Err(cause) = self.accept_handshake(session, frames).await {
            return cause;
        }

        let interval = self.session.heartbeat_interval;
        let limit = interval * self.session.heartbeat_miss_tolerance;
        let mut last_seen = Instant::now();
        let mut last_heartbeat = last_seen;
        let mut ticker = interval_at(last_seen + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = session.cancel_token().cancelled() => {
                    return session.close_cause().unwrap_or(CloseCause::Shutdown);
                }

                _ = ticker.tick() => {
                    if last_seen.elapsed() >= limit {
                        self.metrics.heartbeat_timeout();
                        return CloseCause::HeartbeatTimeout;
                    }
                    if last_heartbeat.elapsed() >= interval {
                        send_heartbeat(session).await;
                    }
                }

                frame = frames.next() => {
                    let packet = match frame {
                        None => return CloseCause::PeerClosed,
                        Some(Err(e)) => return self.cause_for(e),
                        Some(Ok(packet)) => packet,
                    };
                    self.metrics.packet_received(packet.len() as u64);
                    last_seen = Instant::now();

                    match packet.kind {
                        PacketKind::Heartbeat => {
                            last_heartbeat = last_seen;
                            send_heartbeat(session).await;
                        }
                        PacketKind::Data => {
                            if let Err(cause) = self.on_data(session, packet.data, lanes).await {
                                return cause;
                            }
                            // Time spent waiting on a saturated lane is not peer silence
                            if last_seen.elapsed() >= interval {
                                last_seen = Instant::now();
                                ticker.reset();
                            }
                        }
                        PacketKind::Kick => {
                            info!(reason = %String::from_utf8_lossy(&packet.data), "Peer sent kick");
                            return CloseCause::PeerClosed;
                        }
                        PacketKind::Handshake => {
                            self.metrics.protocol_error();
                            return CloseCause::ProtocolViolation(
                                constants::ERR_DUPLICATE_HANDSHAKE.into(),
                            );
                        }
                        PacketKind::HandshakeAck => {
                            self.metrics.protocol_error();
                            return CloseCause::ProtocolViolation(format!(
                                "{}: {}",
                                constants::ERR_UNEXPECTED_PACKET,
                                packet.kind.name()
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn accept_handshake<R>(
        &self,
        session: &Arc<Session>,
        frames: &mut FramedRead<R, PacketCodec>,
    ) -> std::result::Result<(), CloseCause>
    where
        R: AsyncRead + Unpin,
    {
        self.metrics.handshake_attempt();

        let first = tokio::select! {
            _ = session.cancel_token().cancelled() => {
                return Err(session.close_cause().unwrap_or(CloseCause::Shutdown));
            }
            first = tokio::time::timeout(self.handshake_timeout, frames.next()) => first,
        };

        let packet = match first {
            Err(_) => {
                self.metrics.handshake_failed();
                debug!(
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "{}",
                    constants::ERR_HANDSHAKE_TIMEOUT
                );
                return Err(CloseCause::HandshakeTimeout);
            }
            Ok(None) => return Err(CloseCause::PeerClosed),
            Ok(Some(Err(e))) => {
                self.metrics.handshake_failed();
                return Err(self.cause_for(e));
            }
            Ok(Some(Ok(packet))) => packet,
        };
        self.metrics.packet_received(packet.len() as u64);

        if packet.kind != PacketKind::Handshake {
            self.metrics.handshake_failed();
            self.metrics.protocol_error();
            return Err(CloseCause::ProtocolViolation(format!(
                "{}, got {}",
                constants::ERR_EXPECTED_HANDSHAKE,
                packet.kind.name()
            )));
        }

        let negotiated = HandshakeRequest::from_packet(&packet).and_then(|request| {
            let (codes, ack) =
                self.handshake
                    .respond(&request, session.id(), self.router.routes())?;
            Ok((request, codes, ack.to_packet()?))
        });
        let (request, codes, ack) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.metrics.handshake_failed();
                self.metrics.protocol_error();
                return Err(CloseCause::ProtocolViolation(e.to_string()));
            }
        };

        if session.enqueue(ack).await.is_err() {
            return Err(session.close_cause().unwrap_or(CloseCause::Shutdown));
        }
        session.mark_ready(request.client_version, codes);
        self.metrics.handshake_success();
        debug!(client_version = ?session.client_version(), "Session ready");
        Ok(())
    }

    async fn on_data(
        &self,
        session: &Arc<Session>,
        data: Bytes,
        lanes: &Lanes,
    ) -> std::result::Result<(), CloseCause> {
        let codes = session.route_codes();
        let msg = message::decode(data, Some(&codes)).map_err(|e| {
            self.metrics.protocol_error();
            CloseCause::ProtocolViolation(e.to_string())
        })?;

        match msg.kind {
            MessageType::Request => {
                session.begin_request(msg.id).map_err(|e| {
                    self.metrics.protocol_error();
                    CloseCause::ProtocolViolation(e.to_string())
                })?;
                match self.router.resolve(&msg.route) {
                    Ok(entry) => {
                        self.metrics.request_dispatched();
                        lanes.submit(Job { entry, message: msg }).await;
                    }
                    Err(_) => {
                        self.metrics.routing_miss();
                        debug!(id = msg.id, route = %msg.route, "No route for request");
                        let err = RemoteError::new(ErrorKind::NoRoute, msg.route.as_str());
                        if let Err(e) = session.respond_error(msg.id, &err).await {
                            debug!(error = %e, "NoRoute response not sent");
                        }
                    }
                }
            }
            MessageType::Notify => match self.router.resolve(&msg.route) {
                Ok(entry) => {
                    self.metrics.notify_dispatched();
                    lanes.submit(Job { entry, message: msg }).await;
                }
                Err(_) => {
                    self.metrics.routing_miss();
                    warn!(route = %msg.route, "No route for notify, dropped");
                }
            },
            MessageType::Response | MessageType::Push => {
                debug!(kind = ?msg.kind, "Ignoring server-bound message of client-only type");
            }
        }
        Ok(())
    }

    fn cause_for(&self, err: ProtocolError) -> CloseCause {
        match err {
            ProtocolError::Io(e) => {
                self.metrics.connection_error();
                CloseCause::TransportError(e.to_string())
            }
            ProtocolError::ConnectionClosed => CloseCause::PeerClosed,
            other => {
                self.metrics.protocol_error();
                CloseCause::ProtocolViolation(other.to_string())
            }
        }
    }
}

async fn send_heartbeat(session: &Session) {
    if let Err(e) = session.enqueue(Packet::heartbeat()).await {
        debug!(error = %e, "Heartbeat not queued");
    }
}

/// Handler execution lanes of one session.
struct Lanes {
    session: Arc<Session>,
    serial: mpsc::Sender<Job>,
    pool: Arc<Semaphore>,
    tracker: TaskTracker,
    metrics: Arc<Metrics>,
}

impl Lanes {
    fn new(
        session: &Arc<Session>,
        config: &DispatchConfig,
        tracker: &TaskTracker,
        metrics: &Arc<Metrics>,
    ) -> Self {
        let (serial, mut jobs) = mpsc::channel::<Job>(config.inbound_backlog.max(1));
        {
            let session = Arc::clone(session);
            let metrics = Arc::clone(metrics);
            tracker.spawn(async move {
                while let Some(job) = jobs.recv().await {
                    if !session.is_open() {
                        break;
                    }
                    invoke(&session, job, &metrics).await;
                }
            });
        }

        Self {
            session: Arc::clone(session),
            serial,
            pool: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            tracker: tracker.clone(),
            metrics: Arc::clone(metrics),
        }
    }

    /// Hand `job` to its lane. Waits while the lane is saturated, unless the
    /// session closes first.
    async fn submit(&self, job: Job) {
        let cancelled = self.session.cancel_token();
        match job.entry.options.concurrency {
            Concurrency::Serial => {
                tokio::select! {
                    _ = cancelled.cancelled() => {}
                    sent = self.serial.send(job) => {
                        if sent.is_err() {
                            debug!("Serial lane stopped, job discarded");
                        }
                    }
                }
            }
            Concurrency::Parallel => {
                let permit = tokio::select! {
                    _ = cancelled.cancelled() => return,
                    permit = Arc::clone(&self.pool).acquire_owned() => permit,
                };
                let Ok(permit) = permit else { return };
                let session = Arc::clone(&self.session);
                let metrics = Arc::clone(&self.metrics);
                self.tracker.spawn(async move {
                    let _permit = permit;
                    invoke(&session, job, &metrics).await;
                });
            }
        }
    }
}

type Outcome = std::result::Result<HandlerResult, Box<dyn Any + Send>>;

/// Run one handler and send its Response, if the message was a Request.
async fn invoke(session: &Arc<Session>, job: Job, metrics: &Metrics) {
    let Job { entry, message } = job;
    let ctx = Context::new(
        Arc::clone(session),
        Arc::clone(&entry.route),
        message.id,
        entry.options.deadline,
    );
    let is_request = message.kind == MessageType::Request;
    let _timer = Timer::start("handler");

    let outcome: Outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
        (entry.handler)(ctx.clone(), message.data)
    })) {
        Err(panic) => Err(panic),
        Ok(fut) => {
            let guarded = AssertUnwindSafe(fut).catch_unwind();
            tokio::pin!(guarded);
            match entry.options.deadline {
                None => guarded.await,
                Some(deadline) => match tokio::time::timeout(deadline, guarded.as_mut()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        metrics.deadline_expired();
                        ctx.cancel();
                        warn!(
                            route = %entry.route,
                            id = message.id,
                            deadline_ms = deadline.as_millis() as u64,
                            "Handler deadline exceeded"
                        );
                        if is_request {
                            let err = RemoteError::new(
                                ErrorKind::Timeout,
                                constants::ERR_DEADLINE_EXCEEDED,
                            );
                            reply(session, message.id, Err(err)).await;
                        }
                        guarded.await
                    }
                },
            }
        }
    };

    let result = match outcome {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => {
            metrics.handler_error();
            debug!(route = %entry.route, id = message.id, error = %e, "Handler returned error");
            Err(RemoteError::new(ErrorKind::Handler, e.0))
        }
        Err(panic) => {
            metrics.handler_error();
            error!(
                route = %entry.route,
                id = message.id,
                panic = panic_message(panic.as_ref()),
                "Handler panicked"
            );
            Err(RemoteError::new(
                ErrorKind::Internal,
                constants::ERR_HANDLER_PANICKED,
            ))
        }
    };

    if is_request {
        reply(session, message.id, result).await;
    }
}

async fn reply(session: &Session, id: u64, result: std::result::Result<Bytes, RemoteError>) {
    let sent = match result {
        Ok(data) => session.respond(id, data).await,
        Err(err) => session.respond_error(id, &err).await,
    };
    match sent {
        Ok(()) => {}
        Err(ProtocolError::AlreadyResponded(_)) | Err(ProtocolError::SessionClosed) => {
            debug!(id, "Late response discarded");
        }
        Err(e) => debug!(id, error = %e, "Response not sent"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Drain the outbound queue into the connection.
///
/// Before `Closing` the writer runs until the queue is closed. Once `Closing`
/// starts, it gets `grace` to flush what is queued, then drops the rest.
async fn write_loop<W>(
    session: Arc<Session>,
    mut sink: FramedWrite<W, PacketCodec>,
    grace: Duration,
    metrics: Arc<Metrics>,
) where
    W: AsyncWrite + Unpin,
{
    let drained = {
        let drain = drain_outbound(&session, &mut sink, &metrics);
        let expired = async {
            session.closing().await;
            tokio::time::sleep(grace).await;
        };
        tokio::select! {
            res = drain => Some(res),
            _ = expired => {
                warn!(session_id = session.id(), dropped = session.outbound().len(), "Close grace elapsed before outbound queue drained");
                None
            }
            _ = session.force_token().cancelled() => None,
        }
    };
    session.outbound().clear();

    match drained {
        Some(Err(e)) => {
            metrics.connection_error();
            session.close(CloseCause::TransportError(e.to_string()));
        }
        _ => {
            if tokio::time::timeout(FORCE_CLOSE_WAIT, sink.close()).await.is_err() {
                debug!(session_id = session.id(), "Connection shutdown timed out");
            }
        }
    }
}

async fn drain_outbound<W>(
    session: &Session,
    sink: &mut FramedWrite<W, PacketCodec>,
    metrics: &Metrics,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = session.outbound().pop().await {
        let len = packet.len() as u64;
        sink.feed(packet).await?;
        metrics.packet_sent(len);
        if session.outbound().is_empty() {
            sink.flush().await?;
        }
    }
    sink.flush().await
}
