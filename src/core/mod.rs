//! # Core Protocol Components
//!
//! Wire framing for the serial link.
//!
//! This module owns the frame layout and the streaming codec used to read and
//! write frames over any byte-oriented transport.
//!
//! ## Components
//! - **Packet**: frame type, payload, and the id-prefix helpers
//! - **Codec**: Tokio codec for framing over the transport
//!
//! ## Wire Format
//! ```text
//! [Type(1)] [Length(2, big-endian)] [Payload(Length)]
//! ```
//!
//! ## Limits
//! - Maximum payload size: 65535 bytes (the length field is 16 bits)
//! - No magic bytes or checksums: the link is assumed byte-exact, so a
//!   corrupted length field desynchronizes the session until disconnect

pub mod codec;
pub mod packet;
