use crate::error::Result;
use crate::session::Session;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a handler.
///
/// The context is cancelled when the handler's deadline expires or the
/// session starts closing. Cancellation is advisory: the handler keeps running
/// until it returns, so long-running handlers should watch [`Context::cancelled`].
#[derive(Clone)]
pub struct Context {
    session: Arc<Session>,
    route: Arc<str>,
    message_id: u64,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session.id())
            .field("route", &self.route)
            .field("message_id", &self.message_id)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(
        session: Arc<Session>,
        route: Arc<str>,
        message_id: u64,
        deadline: Option<Duration>,
    ) -> Self {
        let cancel = session.cancel_token().child_token();
        Self {
            session,
            route,
            message_id,
            deadline: deadline.map(|d| Instant::now() + d),
            cancel,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Id of the Request being served; 0 for a Notify.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Push a message to the session this invocation belongs to.
    pub async fn push(&self, route: &str, data: impl Into<Bytes>) -> Result<()> {
        self.session.push(route, data).await
    }
}
