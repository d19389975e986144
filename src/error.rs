//! # Error Types
//!
//! Error handling for the dispatch core.
//!
//! Every fallible operation in the crate returns [`ProtocolError`]. The variants
//! fall into the categories below, and [`ProtocolError::kind`] reports which one
//! a given error belongs to so the dispatcher can decide a session's fate from a
//! single place.
//!
//! ## Error Categories
//! - **Protocol**: malformed packets or messages, unknown route codes, version mismatch
//! - **Routing**: no handler registered for a route
//! - **Handler**: a service handler returned an error
//! - **Transport**: connection read/write failures
//! - **Backpressure**: the outbound queue overflowed
//! - **Lifecycle**: closed sessions, double boot, duplicate registrations
//!
//! Handler errors never reach this type directly; they travel back to the peer as
//! an error Response whose payload is rendered by [`RemoteError`].
//!
//! ## Example Usage
//! ```rust
//! use cluster_dispatch::core::packet::{encode, PacketKind};
//! use cluster_dispatch::error::{ErrorCategory, ProtocolError};
//!
//! let oversized = vec![0u8; 1 << 24];
//! match encode(PacketKind::Data, &oversized) {
//!     Err(e @ ProtocolError::PayloadTooLarge(_)) => assert_eq!(e.kind(), ErrorCategory::Protocol),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Router errors
    pub const ERR_ROUTER_WRITE_LOCK: &str = "Failed to acquire write lock on router";
    pub const ERR_ROUTER_READ_LOCK: &str = "Failed to acquire read lock on router";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire service registry lock";

    /// Handshake errors
    pub const ERR_EXPECTED_HANDSHAKE: &str = "Expected a Handshake packet";
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "No handshake received in time";
    pub const ERR_DUPLICATE_HANDSHAKE: &str = "Handshake already completed";

    /// Dispatch errors
    pub const ERR_HANDLER_PANICKED: &str = "handler panicked";
    pub const ERR_DEADLINE_EXCEEDED: &str = "deadline exceeded";
    pub const ERR_UNEXPECTED_PACKET: &str = "Unexpected packet kind for session state";
}

/// Primary error type for all dispatch-core operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // --- packet codec ---
    #[error("Payload too large: {0} bytes (limit is 2^24 - 1)")]
    PayloadTooLarge(usize),

    #[error("Short read: stream ended in the middle of a frame")]
    ShortRead,

    #[error("Unknown packet kind: {0:#04x}")]
    BadKind(u8),

    // --- message codec ---
    #[error("Invalid message flags: {0:#04x}")]
    BadFlags(u8),

    #[error("Message truncated")]
    Truncated,

    #[error("Route must not be empty")]
    RouteEmpty,

    #[error("Route too long: {0} bytes (maximum 255)")]
    RouteTooLong(usize),

    #[error("Malformed route on the wire")]
    MalformedRoute,

    #[error("Message id must be zero for this message type, got {0}")]
    IdForbidden(u64),

    #[error("Message id must be non-zero for this message type")]
    IdRequired,

    #[error("Unknown route code: {0}")]
    UnknownRouteCode(u16),

    // --- routing ---
    #[error("Invalid route component: '{0}'")]
    InvalidRoute(String),

    #[error("Route already registered: {0}")]
    RouteConflict(String),

    #[error("No route: {0}")]
    NoRoute(String),

    #[error("Service already exists: {0}")]
    ServiceExists(String),

    #[error("Service exposes no handlers: {0}")]
    NoHandlers(String),

    // --- session ---
    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Version mismatch: server {server}, client {client}")]
    VersionMismatch { server: String, client: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("Request id {0} is already in flight")]
    DuplicateRequest(u64),

    #[error("Request id {0} was already answered or never received")]
    AlreadyResponded(u64),

    #[error("Outbound queue full")]
    Backpressure,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Kicked by peer: {0}")]
    Kicked(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    // --- node ---
    #[error("Node already booted")]
    AlreadyBooted,

    #[error("Node is not running")]
    NotBooted,

    #[error("Node stopped")]
    NodeStopped,

    #[error("Failed to bind listener: {0}")]
    BindFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Synchronization primitive poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// Coarse classification of errors used to pick a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Routing,
    Handler,
    Transport,
    Backpressure,
    Lifecycle,
    Config,
}

impl ProtocolError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorCategory {
        use ProtocolError::*;
        match self {
            PayloadTooLarge(_) | ShortRead | BadKind(_) | BadFlags(_) | Truncated | RouteEmpty
            | RouteTooLong(_) | MalformedRoute | IdForbidden(_) | IdRequired
            | UnknownRouteCode(_) | HandshakeError(_) | VersionMismatch { .. }
            | DuplicateRequest(_) | Json(_) => ErrorCategory::Protocol,
            NoRoute(_) => ErrorCategory::Routing,
            Remote(_) => ErrorCategory::Handler,
            Io(_) | ConnectionClosed | Kicked(_) | Timeout => ErrorCategory::Transport,
            Backpressure => ErrorCategory::Backpressure,
            InvalidRoute(_) | RouteConflict(_) | ServiceExists(_) | NoHandlers(_)
            | SessionClosed | AlreadyResponded(_) | AlreadyBooted | NotBooted | NodeStopped
            | BindFailed(_) | LockPoisoned(_) => ErrorCategory::Lifecycle,
            ConfigError(_) => ErrorCategory::Config,
        }
    }
}

/// Kind tag carried at the front of an error Response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoRoute,
    Handler,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoRoute => "NoRoute",
            ErrorKind::Handler => "Handler",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Internal => "Internal",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "NoRoute" => Some(ErrorKind::NoRoute),
            "Handler" => Some(ErrorKind::Handler),
            "Timeout" => Some(ErrorKind::Timeout),
            "Internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error description carried in the payload of an error Response.
///
/// The wire form is `"<Kind>: <message>"`, e.g. `NoRoute: does.not.exist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Render the payload bytes for an error Response.
    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse an error Response payload. Unrecognised payloads are reported as
    /// `Internal` with the raw text as the message.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        if let Some((tag, message)) = text.split_once(": ") {
            if let Some(kind) = ErrorKind::from_tag(tag) {
                return Self::new(kind, message);
            }
        }
        Self::new(ErrorKind::Internal, text.into_owned())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
