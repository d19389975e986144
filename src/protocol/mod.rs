//! # Protocol Layer
//!
//! Everything between a framed packet and a handler invocation.
//!
//! ## Components
//! - **Message**: typed envelope inside `Data` packets, with optional route codes
//! - **Handshake**: version check and route-code negotiation for a new session
//! - **Router**: route string to handler table, safe to update while serving
//! - **Dispatcher**: per-session read, decode, route, invoke and write loop

pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod router;

#[cfg(test)]
mod tests;
