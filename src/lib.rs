//! # cluster-dispatch
//!
//! Message dispatch core for clustered application nodes.
//!
//! A [`Node`] accepts client connections, frames the byte stream into
//! [`Packet`]s, runs a small handshake, then decodes `Data` packets into
//! [`Message`]s and routes each Request or Notify to the handler registered for
//! its `<service>.<method>` route. Handlers answer Requests and may push
//! messages back to the session at any time.
//!
//! ## Layers
//! - [`core`]: packet framing and the Tokio codec
//! - [`protocol`]: message codec, handshake, router and per-session dispatcher
//! - [`service`]: the [`Service`] trait, handler context and service registry
//! - [`session`]: per-connection state, outbound queue and close causes
//! - [`transport`]: TCP, Unix socket and in-memory byte streams
//! - [`node`]: composition root and lifecycle
//! - [`client`]: minimal client for tests and tools
//!
//! ## Example
//! ```rust,no_run
//! use bytes::Bytes;
//! use cluster_dispatch::{Client, FnService, Node, NodeConfig};
//!
//! # async fn run() -> cluster_dispatch::Result<()> {
//! let node = Node::configure(NodeConfig::default())?;
//! node.add_service(FnService::new("echo").method("say", |_ctx, data| async move { Ok(data) }))?;
//! node.boot().await?;
//!
//! let mut client = Client::connect("127.0.0.1:3010").await?;
//! let reply = client.request("echo.say", Bytes::from_static(b"hi")).await?;
//! assert_eq!(&reply[..], b"hi");
//!
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod node;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod utils;

pub use client::{Client, ClientOptions, Inbound};
pub use config::NodeConfig;
pub use crate::core::packet::{Packet, PacketKind};
pub use error::{ProtocolError, Result};
pub use node::{Node, NodeState};
pub use protocol::message::{Message, MessageType};
pub use service::{Context, FnService, HandlerError, Service};
pub use session::{CloseCause, Session, SessionState};
