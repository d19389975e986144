//! Unix domain socket transport for same-host clients.

use crate::transport::{BoxConnection, Listener, Transport};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, instrument};

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixTransport;

/// Owns the socket file and removes it when dropped.
struct UnixAcceptor {
    inner: UnixListener,
    path: PathBuf,
    accepted: AtomicU64,
}

impl Listener for UnixAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxConnection, String)>> {
        async move {
            let (stream, _) = self.inner.accept().await?;
            let n = self.accepted.fetch_add(1, Ordering::Relaxed);
            let peer = format!("unix:{}#{n}", self.path.display());
            Ok((Box::new(stream) as BoxConnection, peer))
        }
        .boxed()
    }

    fn local_addr(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                error!(error = %e, path = %self.path.display(), "Failed to remove socket file");
            } else {
                info!(path = %self.path.display(), "Removed socket file");
            }
        }
    }
}

impl Transport for UnixTransport {
    fn listen<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<Box<dyn Listener>>> {
        bind(Path::new(addr)).boxed()
    }

    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxConnection>> {
        async move {
            let stream = UnixStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxConnection)
        }
        .boxed()
    }
}

#[instrument(fields(socket_path = %path.display()))]
async fn bind(path: &Path) -> io::Result<Box<dyn Listener>> {
    // A stale socket file from a previous run would make bind fail.
    if path.exists() {
        tokio::fs::remove_file(path).await.ok();
    }
    let inner = UnixListener::bind(path)?;
    info!(path = %path.display(), "Listening on unix socket");
    Ok(Box::new(UnixAcceptor {
        inner,
        path: path.to_path_buf(),
        accepted: AtomicU64::new(0),
    }))
}
