use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::error::{Result, TunnelError};

/// Frame header: 1 byte type + 2 bytes big-endian payload length
pub const HEADER_SIZE: usize = 3;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Size of the connection / request id prefix carried by some payloads
pub const ID_SIZE: usize = 4;

/// Payload of the handshake frame
pub const HELLO_PAYLOAD: &[u8] = b"HELLO";

/// Frame type carried in the first header byte.
///
/// Unrecognized values are preserved as `Unknown` so newer peers can add
/// frame types without breaking older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Hello,
    InitProxy,
    Data,
    ClosePort,
    Response,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0 => PacketType::Hello,
            1 => PacketType::InitProxy,
            2 => PacketType::Data,
            3 => PacketType::ClosePort,
            4 => PacketType::Response,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Hello => 0,
            PacketType::InitProxy => 1,
            PacketType::Data => 2,
            PacketType::ClosePort => 3,
            PacketType::Response => 4,
            PacketType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Hello => f.write_str("HELLO"),
            PacketType::InitProxy => f.write_str("INIT_PROXY"),
            PacketType::Data => f.write_str("DATA"),
            PacketType::ClosePort => f.write_str("CLOSE_PORT"),
            PacketType::Response => f.write_str("RESPONSE"),
            PacketType::Unknown(other) => write!(f, "UNKNOWN({other})"),
        }
    }
}

/// One complete frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

/// Queued unit of work for the duplexer. Producers hand over ownership of the
/// frame and return as soon as it is queued, never touching the transport.
pub type OutgoingPacket = Packet;

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    pub fn hello() -> Self {
        Self::new(PacketType::Hello, HELLO_PAYLOAD)
    }

    /// Data frame: 4-byte big-endian connection id followed by raw bytes
    pub fn data(connection_id: u32, bytes: &[u8]) -> Self {
        Self::new(PacketType::Data, prefix_id(connection_id, bytes))
    }

    /// ClosePort frame: decimal ASCII connection id
    pub fn close_port(connection_id: u32) -> Self {
        Self::new(PacketType::ClosePort, connection_id.to_string().into_bytes())
    }

    /// Total encoded size including the header
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    ///
    /// The size check happens before anything is written, so an oversized
    /// payload leaves `dst` untouched.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::OversizedPayload(len));
        }

        dst.reserve(HEADER_SIZE + len);
        dst.put_u8(self.packet_type.into());
        dst.put_u16(len as u16);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode exactly one frame from a complete buffer.
    ///
    /// Bytes after the frame are ignored. A buffer that ends before the
    /// header or payload is complete yields `TruncatedFrame`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(TunnelError::TruncatedFrame {
                expected: HEADER_SIZE,
                received: buf.len(),
            });
        }

        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let end = HEADER_SIZE + len;
        if buf.len() < end {
            return Err(TunnelError::TruncatedFrame {
                expected: end,
                received: buf.len(),
            });
        }

        Ok(Self::new(buf[0].into(), &buf[HEADER_SIZE..end]))
    }

    /// Split a 4-byte big-endian id off the front of the payload.
    pub fn split_id(&self) -> Result<(u32, &[u8])> {
        split_id(&self.payload)
    }
}

/// Prepend `id` as 4 big-endian bytes to `payload`.
pub fn prefix_id(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ID_SIZE + payload.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read a 4-byte big-endian id from the front of `payload`.
pub fn split_id(payload: &[u8]) -> Result<(u32, &[u8])> {
    match payload.split_first_chunk::<ID_SIZE>() {
        Some((id, rest)) => Ok((u32::from_be_bytes(*id), rest)),
        None => Err(TunnelError::ShortPayload(payload.len())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn packet_type_byte_values() {
        for (byte, ty) in [
            (0u8, PacketType::Hello),
            (1, PacketType::InitProxy),
            (2, PacketType::Data),
            (3, PacketType::ClosePort),
            (4, PacketType::Response),
        ] {
            assert_eq!(PacketType::from(byte), ty);
            assert_eq!(u8::from(ty), byte);
        }
        assert_eq!(PacketType::from(9), PacketType::Unknown(9));
        assert_eq!(u8::from(PacketType::Unknown(9)), 9);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let packet = Packet::new(PacketType::Data, vec![0xAA; 0x0102]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..3], &[2, 0x01, 0x02]);
        assert_eq!(bytes.len(), 3 + 0x0102);
    }

    #[test]
    fn oversized_payload_writes_nothing() {
        let packet = Packet::new(PacketType::Data, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = packet.encode_into(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::OversizedPayload(65536)));
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn data_frame_carries_connection_id() {
        let packet = Packet::data(0x0102_0304, b"ping");
        assert_eq!(&packet.payload[..4], &[1, 2, 3, 4]);
        let (id, rest) = packet.split_id().unwrap();
        assert_eq!(id, 0x0102_0304);
        assert_eq!(rest, b"ping");
    }

    #[test]
    fn close_port_is_decimal_ascii() {
        assert_eq!(Packet::close_port(42).payload, b"42".to_vec());
    }

    #[test]
    fn from_bytes_reports_truncation() {
        let bytes = Packet::new(PacketType::Response, b"abcdef".to_vec())
            .to_bytes()
            .unwrap();
        match Packet::from_bytes(&bytes[..5]) {
            Err(TunnelError::TruncatedFrame { expected, received }) => {
                assert_eq!(expected, 9);
                assert_eq!(received, 5);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            Packet::from_bytes(&bytes[..1]),
            Err(TunnelError::TruncatedFrame { expected: 3, .. })
        ));
    }

    #[test]
    fn split_id_rejects_short_payload() {
        assert!(matches!(split_id(&[1, 2, 3]), Err(TunnelError::ShortPayload(3))));
        assert_eq!(split_id(&[0, 0, 0, 5]).unwrap(), (5, &[][..]));
    }
}
