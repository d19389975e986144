//! # Node
//!
//! Composition root: owns the router, the service registry, the live sessions
//! and the listener.
//!
//! ```text
//! Configured ──boot──▶ Running ──shutdown──▶ Stopped
//! ```
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use cluster_dispatch::config::NodeConfig;
//! use cluster_dispatch::node::Node;
//! use cluster_dispatch::service::FnService;
//! use std::time::Duration;
//!
//! # async fn run() -> cluster_dispatch::error::Result<()> {
//! let node = Node::configure(NodeConfig::default())?;
//! node.add_service(
//!     FnService::new("slots").method("login", |_ctx, _data| async { Ok(Bytes::from_static(b"ok")) }),
//! )?;
//! node.boot().await?;
//! // ...
//! node.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

use crate::cluster::{MembershipOracle, Peer};
use crate::config::NodeConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::router::Router;
use crate::service::{Service, ServiceRegistry};
use crate::session::{notify_all, CloseCause, NotifyReport, Session, SessionState};
use crate::transport::tcp::TcpTransport;
use crate::transport::{Listener, Transport};
use crate::utils::timeout::FORCE_CLOSE_WAIT;
use crate::utils::{Metrics, MetricsSnapshot};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Configured,
    Running,
    Stopped,
}

/// State shared with the accept loop.
struct Shared {
    config: NodeConfig,
    router: Arc<Router>,
    registry: ServiceRegistry,
    dispatcher: Dispatcher,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), session);
    }

    fn remove(&self, id: u64) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

struct Lifecycle {
    tracker: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
}

pub struct Node {
    shared: Arc<Shared>,
    membership: Option<Arc<dyn MembershipOracle>>,
    state: watch::Sender<NodeState>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    local_addr: OnceLock<String>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("services", &self.shared.registry.names())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::build(NodeConfig::default())
    }
}

impl Node {
    /// Node with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Node with `config`, which must pass [`NodeConfig::validate_strict`].
    pub fn configure(config: NodeConfig) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self::build(config))
    }

    fn build(config: NodeConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let router = Arc::new(Router::new());
        let registry =
            ServiceRegistry::with_config(Arc::clone(&router), &config.dispatch, &config.services);
        let dispatcher = Dispatcher::new(Arc::clone(&router), &config, Arc::clone(&metrics));
        let (state, _) = watch::channel(NodeState::Configured);

        Self {
            shared: Arc::new(Shared {
                config,
                router,
                registry,
                dispatcher,
                sessions: RwLock::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                metrics,
            }),
            membership: None,
            state,
            lifecycle: Mutex::new(Lifecycle {
                tracker: TaskTracker::new(),
                accept_task: None,
            }),
            shutdown: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Attach a membership oracle. The dispatch path never consults it.
    pub fn with_membership(mut self, oracle: Arc<dyn MembershipOracle>) -> Self {
        self.membership = Some(oracle);
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Register a service and its routes. Allowed before and after boot.
    pub fn add_service<S: Service>(&self, service: S) -> Result<()> {
        self.shared.registry.add(Arc::new(service))
    }

    pub fn add_shared_service(&self, service: Arc<dyn Service>) -> Result<()> {
        self.shared.registry.add(service)
    }

    pub fn remove_service(&self, name: &str) -> Result<Option<Arc<dyn Service>>> {
        self.shared.registry.remove(name)
    }

    /// Bind the configured address and start accepting sessions.
    ///
    /// Absolute paths bind a Unix domain socket, anything else is TCP.
    pub async fn boot(&self) -> Result<()> {
        let addr = &self.shared.config.server.listen_address;
        #[cfg(unix)]
        if addr.starts_with('/') {
            return self.boot_with(&crate::transport::local::UnixTransport).await;
        }
        if addr.starts_with("memory://") {
            return Err(ProtocolError::BindFailed(format!(
                "{addr}: in-memory addresses need Node::boot_with"
            )));
        }
        self.boot_with(&TcpTransport).await
    }

    /// Boot on a specific transport.
    #[instrument(skip_all, fields(address = %self.shared.config.server.listen_address))]
    pub async fn boot_with(&self, transport: &dyn Transport) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            NodeState::Running => return Err(ProtocolError::AlreadyBooted),
            NodeState::Stopped => return Err(ProtocolError::NodeStopped),
            NodeState::Configured => {}
        }

        let addr = &self.shared.config.server.listen_address;
        let listener = transport
            .listen(addr)
            .await
            .map_err(|e| ProtocolError::BindFailed(format!("{addr}: {e}")))?;
        let local = listener.local_addr();
        let _ = self.local_addr.set(local.clone());

        lifecycle.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.shutdown.clone(),
            lifecycle.tracker.clone(),
        )));
        self.state.send_replace(NodeState::Running);

        info!(
            address = %local,
            services = self.shared.registry.len(),
            routes = self.shared.router.len(),
            "Node booted"
        );
        Ok(())
    }

    /// Stop accepting, close every session and wait for them to finish.
    ///
    /// Sessions still open after `grace` are forced closed. Shutting down a
    /// stopped node is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            NodeState::Configured => return Err(ProtocolError::NotBooted),
            NodeState::Stopped => return Ok(()),
            NodeState::Running => {}
        }

        info!(sessions = self.session_count(), "Shutting down node");
        self.shutdown.cancel();
        if let Some(task) = lifecycle.accept_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop failed");
            }
        }

        for session in self.shared.sessions() {
            session.close(CloseCause::Shutdown);
        }
        lifecycle.tracker.close();

        if tokio::time::timeout(grace, lifecycle.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.session_count(),
                "Shutdown grace elapsed, forcing sessions closed"
            );
            for session in self.shared.sessions() {
                session.force_close();
            }
            if tokio::time::timeout(FORCE_CLOSE_WAIT, lifecycle.tracker.wait())
                .await
                .is_err()
            {
                warn!(remaining = self.session_count(), "Sessions did not release in time");
            }
        }

        self.state.send_replace(NodeState::Stopped);
        self.shared.metrics.log_metrics();
        info!("Node stopped");
        Ok(())
    }

    /// Shut down using the configured grace period.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown(self.shared.config.server.shutdown_grace).await
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Bound address once booted. For TCP this carries the actual port.
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.get().map(String::as_str)
    }

    /// Send a Notify to every ready session.
    pub async fn broadcast(&self, route: &str, data: impl Into<Bytes>) -> NotifyReport {
        let ready: Vec<Arc<Session>> = self
            .shared
            .sessions()
            .into_iter()
            .filter(|s| s.state() == SessionState::Ready)
            .collect();
        notify_all(&ready, route, data.into()).await
    }

    /// Close session `id`, telling the client `reason`.
    pub fn kick(&self, id: u64, reason: &str) -> Result<()> {
        let session = self.session(id).ok_or(ProtocolError::SessionClosed)?;
        session.close(CloseCause::Kicked(reason.to_string()));
        Ok(())
    }

    /// Snapshot of live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.shared.sessions()
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.shared.session_count()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.shared.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Current cluster members, if a membership oracle is attached.
    pub fn members(&self) -> Vec<Peer> {
        self.membership
            .as_ref()
            .map(|oracle| oracle.members())
            .unwrap_or_default()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let max_connections = shared.config.server.max_connections;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (conn, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                shared.metrics.connection_error();
                error!(error = %e, "Error accepting connection");
                continue;
            }
        };

        if shared.session_count() >= max_connections {
            shared.metrics.session_rejected();
            warn!(peer = %peer, max_connections, "Connection limit reached, rejecting");
            drop(conn);
            continue;
        }

        let id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            peer,
            &shared.config.session,
            Arc::clone(&shared.metrics),
        );
        shared.insert(Arc::clone(&session));
        shared.metrics.session_opened();
        debug!(session_id = id, peer = %session.remote_addr(), "Session accepted");

        if shutdown.is_cancelled() {
            session.close(CloseCause::Shutdown);
        }

        let shared = Arc::clone(&shared);
        tracker.spawn(async move {
            shared.dispatcher.run(Arc::clone(&session), conn).await;
            shared.remove(session.id());
        });
    }
    debug!("Accept loop stopped");
}
