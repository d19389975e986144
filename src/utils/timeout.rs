//! Timeout defaults and helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default client heartbeat interval advertised at handshake.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long a closing session may spend draining its outbound queue.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How long a new connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for node shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Upper bound on waiting for forcibly closed sessions to release their tasks,
/// and on flushing a connection that is being shut down.
pub const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Default per-operation timeout for the client.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut`, failing with [`ProtocolError::Timeout`] if it takes longer than `duration`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}
