#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use serial_mux::core::codec::PacketCodec;
use serial_mux::Packet;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Single-frame decode must never panic
    let _ = Packet::from_bytes(data);

    // Streaming decode, fed in uneven pieces
    let mut codec = PacketCodec;
    let mut buf = BytesMut::new();
    for piece in data.chunks(7) {
        buf.extend_from_slice(piece);
        while let Ok(Some(packet)) = codec.decode(&mut buf) {
            let _ = packet.split_id();
        }
    }
    let _ = codec.decode_eof(&mut buf);
});
