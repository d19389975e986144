//! # Transports
//!
//! The dispatch core only needs a byte stream per client. A [`Transport`]
//! produces [`Listener`]s (server side) and connections (client side); a
//! connection is anything that reads, writes and can be shut down.
//!
//! ## Implementations
//! - **TCP** ([`tcp::TcpTransport`]): default for [`crate::node::Node::boot`]
//! - **Unix domain sockets** ([`local::UnixTransport`], Unix only)
//! - **In-memory** ([`memory::MemoryTransport`]): duplex pipes inside one process

#[cfg(unix)]
pub mod local;
pub mod memory;
pub mod tcp;

use futures::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to one peer.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxConnection = Box<dyn Connection>;

/// Accepts incoming connections.
pub trait Listener: Send {
    /// Next connection and a printable peer address.
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxConnection, String)>>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> String;
}

/// Opens listeners and outbound connections.
pub trait Transport: Send + Sync {
    fn listen<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<Box<dyn Listener>>>;

    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxConnection>>;
}
