use crate::transport::{BoxConnection, Listener, Transport};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument};

/// TCP transport. Disables Nagle on every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

struct TcpAcceptor {
    inner: TcpListener,
}

impl Listener for TcpAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxConnection, String)>> {
        async move {
            let (stream, peer) = self.inner.accept().await?;
            stream.set_nodelay(true)?;
            debug!(peer = %peer, "Accepted TCP connection");
            Ok((Box::new(stream) as BoxConnection, peer.to_string()))
        }
        .boxed()
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}

impl Transport for TcpTransport {
    fn listen<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<Box<dyn Listener>>> {
        bind(addr).boxed()
    }

    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxConnection>> {
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxConnection)
        }
        .boxed()
    }
}

#[instrument]
async fn bind(addr: &str) -> io::Result<Box<dyn Listener>> {
    let inner = TcpListener::bind(addr).await?;
    info!(address = %inner.local_addr()?, "Listening on TCP");
    Ok(Box::new(TcpAcceptor { inner }))
}
