use crate::core::packet::{parse_header, Packet, HEADER_SIZE};
use crate::error::{ProtocolError, Result};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Framing codec for [`Packet`]s on a byte stream.
///
/// Splits complete frames off the read buffer without copying the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.is_empty() {
            return Ok(None);
        }

        let (kind, length) = match parse_header(src) {
            Ok(header) => header,
            Err(ProtocolError::ShortRead) => return Ok(None),
            Err(e) => return Err(e),
        };

        let frame_len = HEADER_SIZE + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let data = frame.split_off(HEADER_SIZE).freeze();
        Ok(Some(Packet { kind, data }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::ShortRead),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst)
    }
}
