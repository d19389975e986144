//! Typed message envelope carried inside `Data` packets.
//!
//! ```text
//! byte 0      flags: bits 0..2 type, bit 3 route-compressed, bit 4 error
//! bytes 1..8  id (big-endian u64), Request and Response only
//! route       Request/Notify/Push only:
//!             compressed   -> u16 route code
//!             uncompressed -> u8 length + UTF-8 bytes
//! rest        payload
//! ```

use crate::error::{ProtocolError, RemoteError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};

const TYPE_MASK: u8 = 0b0000_0111;
const FLAG_ROUTE_COMPRESSED: u8 = 0b0000_1000;
const FLAG_ERROR: u8 = 0b0001_0000;

/// Longest route accepted in the uncompressed form.
pub const MAX_ROUTE_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Notify = 1,
    Response = 2,
    Push = 3,
}

impl MessageType {
    fn from_flags(flags: u8) -> Result<Self> {
        match flags & TYPE_MASK {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Notify),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Push),
            _ => Err(ProtocolError::BadFlags(flags)),
        }
    }

    /// Request and Response carry a correlation id on the wire.
    pub fn has_id(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }

    /// Everything except Response is addressed by route.
    pub fn has_route(self) -> bool {
        !matches!(self, MessageType::Response)
    }
}

/// In-memory message.
///
/// `version` is informational: it is negotiated once per session at handshake
/// and never travels with individual messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub id: u64,
    pub route: String,
    pub version: String,
    pub data: Bytes,
    pub error: bool,
}

impl Message {
    fn build(kind: MessageType, id: u64, route: String, data: Bytes) -> Self {
        Self {
            kind,
            id,
            route,
            version: String::new(),
            data,
            error: false,
        }
    }

    pub fn request(id: u64, route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::build(MessageType::Request, id, route.into(), data.into())
    }

    pub fn notify(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::build(MessageType::Notify, 0, route.into(), data.into())
    }

    pub fn push(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::build(MessageType::Push, 0, route.into(), data.into())
    }

    pub fn response(id: u64, data: impl Into<Bytes>) -> Self {
        Self::build(MessageType::Response, id, String::new(), data.into())
    }

    pub fn error_response(id: u64, err: &RemoteError) -> Self {
        let mut msg = Self::response(id, err.to_payload());
        msg.error = true;
        msg
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Decoded error description, for error Responses.
    pub fn remote_error(&self) -> Option<RemoteError> {
        (self.kind == MessageType::Response && self.error).then(|| RemoteError::parse(&self.data))
    }

    fn validate(&self) -> Result<()> {
        match self.kind {
            MessageType::Request | MessageType::Response if self.id == 0 => {
                return Err(ProtocolError::IdRequired)
            }
            MessageType::Notify | MessageType::Push if self.id != 0 => {
                return Err(ProtocolError::IdForbidden(self.id))
            }
            _ => {}
        }
        if self.kind.has_route() {
            if self.route.is_empty() {
                return Err(ProtocolError::RouteEmpty);
            }
            if self.route.contains('\0') {
                return Err(ProtocolError::MalformedRoute);
            }
        }
        Ok(())
    }
}

/// Negotiated table of 16-bit aliases for route strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteCodes {
    by_code: BTreeMap<u16, String>,
    by_route: HashMap<String, u16>,
}

impl RouteCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign codes `1..` to the given routes in lexical order.
    /// Duplicates collapse; routes beyond the code space stay uncompressed.
    pub fn from_routes<I, S>(routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sorted: Vec<String> = routes.into_iter().map(Into::into).collect();
        sorted.sort();
        sorted.dedup();

        let table = sorted
            .into_iter()
            .zip(1..=u16::MAX)
            .map(|(route, code)| (code, route))
            .collect();
        Self::from_table(table)
    }

    /// Rebuild from a table received at handshake.
    pub fn from_table(by_code: BTreeMap<u16, String>) -> Self {
        let by_route = by_code
            .iter()
            .map(|(code, route)| (route.clone(), *code))
            .collect();
        Self { by_code, by_route }
    }

    pub fn code(&self, route: &str) -> Option<u16> {
        self.by_route.get(route).copied()
    }

    pub fn route(&self, code: u16) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    pub fn table(&self) -> &BTreeMap<u16, String> {
        &self.by_code
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// Encode a message. When `codes` knows the route, the compressed form is used.
pub fn encode(msg: &Message, codes: Option<&RouteCodes>) -> Result<Bytes> {
    msg.validate()?;

    let mut flags = msg.kind as u8;
    if msg.kind == MessageType::Response && msg.error {
        flags |= FLAG_ERROR;
    }

    let code = if msg.kind.has_route() {
        codes.and_then(|c| c.code(&msg.route))
    } else {
        None
    };
    if code.is_some() {
        flags |= FLAG_ROUTE_COMPRESSED;
    }

    let mut dst = BytesMut::with_capacity(1 + 8 + 1 + msg.route.len() + msg.data.len());
    dst.put_u8(flags);
    if msg.kind.has_id() {
        dst.put_u64(msg.id);
    }
    if msg.kind.has_route() {
        match code {
            Some(code) => dst.put_u16(code),
            None => {
                let route = msg.route.as_bytes();
                if route.len() > MAX_ROUTE_LEN {
                    return Err(ProtocolError::RouteTooLong(route.len()));
                }
                dst.put_u8(route.len() as u8);
                dst.put_slice(route);
            }
        }
    }
    dst.put_slice(&msg.data);
    Ok(dst.freeze())
}

/// Decode a message from a `Data` packet payload. The payload is sliced, not copied.
pub fn decode(mut src: Bytes, codes: Option<&RouteCodes>) -> Result<Message> {
    if !src.has_remaining() {
        return Err(ProtocolError::Truncated);
    }
    let flags = src.get_u8();
    let kind = MessageType::from_flags(flags)?;

    let mut id = 0;
    if kind.has_id() {
        if src.remaining() < 8 {
            return Err(ProtocolError::Truncated);
        }
        id = src.get_u64();
        if id == 0 {
            return Err(ProtocolError::IdRequired);
        }
    }

    let mut route = String::new();
    if kind.has_route() {
        if flags & FLAG_ROUTE_COMPRESSED != 0 {
            if src.remaining() < 2 {
                return Err(ProtocolError::Truncated);
            }
            let code = src.get_u16();
            route = codes
                .and_then(|c| c.route(code))
                .ok_or(ProtocolError::UnknownRouteCode(code))?
                .to_string();
        } else {
            if !src.has_remaining() {
                return Err(ProtocolError::Truncated);
            }
            let len = src.get_u8() as usize;
            if len == 0 {
                return Err(ProtocolError::RouteEmpty);
            }
            if src.remaining() < len {
                return Err(ProtocolError::Truncated);
            }
            let raw = src.split_to(len);
            route = std::str::from_utf8(&raw)
                .map_err(|_| ProtocolError::MalformedRoute)?
                .to_string();
            if route.contains('\0') {
                return Err(ProtocolError::MalformedRoute);
            }
        }
    }

    Ok(Message {
        kind,
        id,
        route,
        version: String::new(),
        data: src,
        error: kind == MessageType::Response && flags & FLAG_ERROR != 0,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn request_wire_layout() {
        let bytes = encode(&Message::request(7, "slots.login", &b"x"[..]), None).unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..9], &7u64.to_be_bytes());
        assert_eq!(bytes[9], 11);
        assert_eq!(&bytes[10..21], b"slots.login");
        assert_eq!(&bytes[21..], b"x");
    }

    #[test]
    fn push_has_no_id_on_wire() {
        let bytes = encode(&Message::push("chat.msg", &b""[..]), None).unwrap();
        assert_eq!(&bytes[..], &[0x03, 8, b'c', b'h', b'a', b't', b'.', b'm', b's', b'g']);
    }

    #[test]
    fn compressed_route_uses_code() {
        let codes = RouteCodes::from_routes(["b.two", "a.one"]);
        assert_eq!(codes.code("a.one"), Some(1));
        assert_eq!(codes.code("b.two"), Some(2));

        let msg = Message::notify("b.two", &b"hi"[..]);
        let bytes = encode(&msg, Some(&codes)).unwrap();
        assert_eq!(&bytes[..], &[0x01 | FLAG_ROUTE_COMPRESSED, 0x00, 0x02, b'h', b'i']);
        assert_eq!(decode(bytes, Some(&codes)).unwrap(), msg);
    }

    #[test]
    fn unknown_route_code() {
        let bytes = Bytes::from_static(&[0x01 | FLAG_ROUTE_COMPRESSED, 0x00, 0x09]);
        assert!(matches!(
            decode(bytes.clone(), Some(&RouteCodes::new())),
            Err(ProtocolError::UnknownRouteCode(9))
        ));
        assert!(matches!(
            decode(bytes, None),
            Err(ProtocolError::UnknownRouteCode(9))
        ));
    }

    #[test]
    fn reserved_bits_ignored_on_decode() {
        let mut raw = encode(&Message::notify("a.b", &b"z"[..]), None)
            .unwrap()
            .to_vec();
        raw[0] |= 0b1110_0000;
        let msg = decode(Bytes::from(raw), None).unwrap();
        assert_eq!(msg, Message::notify("a.b", &b"z"[..]));
    }

    #[test]
    fn bad_type_bits() {
        assert!(matches!(
            decode(Bytes::from_static(&[0x05]), None),
            Err(ProtocolError::BadFlags(0x05))
        ));
    }

    #[test]
    fn id_rules() {
        assert!(matches!(
            encode(&Message::request(0, "a.b", Bytes::new()), None),
            Err(ProtocolError::IdRequired)
        ));
        let mut push = Message::push("a.b", Bytes::new());
        push.id = 3;
        assert!(matches!(
            encode(&push, None),
            Err(ProtocolError::IdForbidden(3))
        ));

        let mut raw = vec![0x02];
        raw.extend_from_slice(&0u64.to_be_bytes());
        assert!(matches!(
            decode(Bytes::from(raw), None),
            Err(ProtocolError::IdRequired)
        ));
    }

    #[test]
    fn empty_and_truncated() {
        assert!(matches!(
            encode(&Message::notify("", Bytes::new()), None),
            Err(ProtocolError::RouteEmpty)
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[0x01, 0x00]), None),
            Err(ProtocolError::RouteEmpty)
        ));
        assert!(matches!(
            decode(Bytes::new(), None),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[0x00, 0x00, 0x01]), None),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[0x01, 0x05, b'a']), None),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn route_too_long() {
        let route = "a".repeat(256);
        assert!(matches!(
            encode(&Message::notify(route, Bytes::new()), None),
            Err(ProtocolError::RouteTooLong(256))
        ));
    }

    #[test]
    fn error_response_roundtrip() {
        let err = RemoteError::new(ErrorKind::NoRoute, "does.not.exist");
        let msg = Message::error_response(9, &err);
        let decoded = decode(encode(&msg, None).unwrap(), None).unwrap();
        assert!(decoded.error);
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.remote_error(), Some(err));
    }

    #[test]
    fn error_flag_ignored_outside_response() {
        let mut raw = encode(&Message::notify("a.b", Bytes::new()), None)
            .unwrap()
            .to_vec();
        raw[0] |= FLAG_ERROR;
        assert!(!decode(Bytes::from(raw), None).unwrap().error);
    }
}
