//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Listeners register under an address such as `memory://node-a` in a
//! registry shared by clones of one [`MemoryTransport`].

use crate::transport::{BoxConnection, Listener, Transport};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type Registry = Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>;

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    listeners: Registry,
    pipe_capacity: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Transport whose pipes buffer at most `pipe_capacity` bytes per direction.
    pub fn with_capacity(pipe_capacity: usize) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            pipe_capacity: pipe_capacity.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<DuplexStream>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryAcceptor {
    addr: String,
    incoming: mpsc::Receiver<DuplexStream>,
    accepted: u64,
    listeners: Registry,
}

impl Listener for MemoryAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxConnection, String)>> {
        async move {
            let stream = self.incoming.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "memory listener closed")
            })?;
            self.accepted += 1;
            let peer = format!("{}#{}", self.addr, self.accepted);
            Ok((Box::new(stream) as BoxConnection, peer))
        }
        .boxed()
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.addr);
    }
}

impl Transport for MemoryTransport {
    fn listen<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<Box<dyn Listener>>> {
        async move {
            let mut registry = self.registry();
            if registry.contains_key(addr) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{addr} is already bound"),
                ));
            }
            let (tx, rx) = mpsc::channel(128);
            registry.insert(addr.to_string(), tx);
            Ok(Box::new(MemoryAcceptor {
                addr: addr.to_string(),
                incoming: rx,
                accepted: 0,
                listeners: Arc::clone(&self.listeners),
            }) as Box<dyn Listener>)
        }
        .boxed()
    }

    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxConnection>> {
        async move {
            let listener = self.registry().get(addr).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening on {addr}"))
            })?;
            let (client, server) = tokio::io::duplex(self.pipe_capacity);
            listener.send(server).await.map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("{addr} stopped listening"))
            })?;
            Ok(Box::new(client) as BoxConnection)
        }
        .boxed()
    }
}
