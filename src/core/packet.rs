//! Length-prefixed packet framing.
//!
//! ```text
//! [Kind(1)] [Length(3, big-endian)] [Data(N)]
//! ```

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 4;

/// Largest payload representable in the 24-bit length field.
pub const MAX_PACKET_DATA: usize = (1 << 24) - 1;

/// Packet kinds understood by the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0,
    HandshakeAck = 1,
    Heartbeat = 2,
    Data = 3,
    Kick = 4,
}

impl PacketKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Handshake => "Handshake",
            PacketKind::HandshakeAck => "HandshakeAck",
            PacketKind::Heartbeat => "Heartbeat",
            PacketKind::Data => "Data",
            PacketKind::Kick => "Kick",
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketKind::Handshake),
            1 => Ok(PacketKind::HandshakeAck),
            2 => Ok(PacketKind::Heartbeat),
            3 => Ok(PacketKind::Data),
            4 => Ok(PacketKind::Kick),
            other => Err(ProtocolError::BadKind(other)),
        }
    }
}

/// A single frame on the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub data: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Zero-length heartbeat packet.
    pub fn heartbeat() -> Self {
        Self::new(PacketKind::Heartbeat, Bytes::new())
    }

    /// Kick packet carrying a UTF-8 reason.
    pub fn kick(reason: &str) -> Self {
        Self::new(PacketKind::Kick, Bytes::copy_from_slice(reason.as_bytes()))
    }

    /// Value of the length field for this packet.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        encode(self.kind, &self.data)
    }

    /// Append the encoded frame to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        write_header(self.kind, self.data.len(), dst)?;
        dst.put_slice(&self.data);
        Ok(())
    }

    /// Parse exactly one frame from the front of `buf`, ignoring trailing bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (kind, length) = parse_header(buf)?;
        let end = HEADER_SIZE + length;
        if buf.len() < end {
            return Err(ProtocolError::ShortRead);
        }
        Ok(Self::new(kind, Bytes::copy_from_slice(&buf[HEADER_SIZE..end])))
    }
}

/// Encode a frame of the given kind.
///
/// Fails with [`ProtocolError::PayloadTooLarge`] when `data` does not fit the
/// 24-bit length field.
pub fn encode(kind: PacketKind, data: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + data.len());
    write_header(kind, data.len(), &mut dst)?;
    dst.put_slice(data);
    Ok(dst.freeze())
}

/// Read exactly one frame from `reader`.
///
/// Never reads past the end of the current frame. End of stream before the
/// first header byte yields [`ProtocolError::ConnectionClosed`]; end of stream
/// anywhere after that yields [`ProtocolError::ShortRead`].
pub async fn decode<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    let kind = PacketKind::try_from(header[0])?;
    read_exact_or_short(reader, &mut header[1..]).await?;

    let length = length_from(&header);
    let mut data = vec![0u8; length];
    read_exact_or_short(reader, &mut data).await?;

    Ok(Packet::new(kind, data))
}

async fn read_exact_or_short<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::ShortRead),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

pub(crate) fn write_header(kind: PacketKind, length: usize, dst: &mut BytesMut) -> Result<()> {
    if length > MAX_PACKET_DATA {
        return Err(ProtocolError::PayloadTooLarge(length));
    }
    dst.reserve(HEADER_SIZE + length);
    dst.put_u8(kind.as_u8());
    dst.put_uint(length as u64, 3);
    Ok(())
}

/// Validate the header at the front of `buf` and return kind and length.
///
/// The kind is checked as soon as one byte is available so that garbage is
/// rejected without waiting for a full header.
pub(crate) fn parse_header(buf: &[u8]) -> Result<(PacketKind, usize)> {
    let first = buf.first().ok_or(ProtocolError::ShortRead)?;
    let kind = PacketKind::try_from(*first)?;
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::ShortRead);
    }
    Ok((kind, length_from(buf)))
}

#[inline]
fn length_from(header: &[u8]) -> usize {
    ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize
}
