//! # Core Framing Components
//!
//! Low-level packet handling for the dispatch core.
//!
//! ## Components
//! - **Packet**: kind-tagged, length-prefixed frame
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Kind(1)] [Length(3)] [Data(N)]
//! ```
//!
//! Kinds are `Handshake(0)`, `HandshakeAck(1)`, `Heartbeat(2)`, `Data(3)` and
//! `Kick(4)`. The length is big-endian, so a frame carries at most 16 MiB - 1
//! bytes of data.

pub mod codec;
pub mod packet;
