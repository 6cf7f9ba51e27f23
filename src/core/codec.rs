use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{Packet, HEADER_SIZE};
use crate::error::{Result, TunnelError};

/// Streaming codec for the serial frame format.
///
/// Partial reads are buffered until a whole frame is available, so the
/// transport may deliver a frame in arbitrarily small pieces.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        let frame_len = HEADER_SIZE + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let packet_type = src[0].into();
        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).to_vec();

        Ok(Some(Packet {
            packet_type,
            payload,
        }))
    }

    /// A clean end of stream is only allowed on a frame boundary.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(packet) = self.decode(buf)? {
            return Ok(Some(packet));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let expected = if buf.len() < HEADER_SIZE {
            HEADER_SIZE
        } else {
            HEADER_SIZE + u16::from_be_bytes([buf[1], buf[2]]) as usize
        };
        Err(TunnelError::TruncatedFrame {
            expected,
            received: buf.len(),
        })
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst)
    }
}
