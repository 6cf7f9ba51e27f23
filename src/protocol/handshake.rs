//! Hello handshake
//!
//! Exactly one Hello frame is exchanged in each direction before tunneling
//! starts. The client speaks first and the server answers, which fixes the
//! bootstrap order and proves a live peer is on the other end of the link.
//! Anything other than Hello as the first frame aborts the session.
//!
//! The handshake runs before the duplexer exists, so it writes to the
//! transport directly.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument};

use crate::config::Role;
use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, Result, TunnelError};

/// Run the handshake for `role`
#[instrument(skip(reader, writer))]
pub async fn handshake<R, W>(
    role: Role,
    reader: &mut FramedRead<R, PacketCodec>,
    writer: &mut FramedWrite<W, PacketCodec>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match role {
        Role::Client => client_handshake(reader, writer).await,
        Role::Server => server_handshake(reader, writer).await,
    }
}

/// Send Hello, then wait for the server's Hello
pub async fn client_handshake<R, W>(
    reader: &mut FramedRead<R, PacketCodec>,
    writer: &mut FramedWrite<W, PacketCodec>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_hello(writer).await?;
    wait_hello(reader).await?;
    Ok(())
}

/// Wait for the client's Hello, then answer with our own
pub async fn server_handshake<R, W>(
    reader: &mut FramedRead<R, PacketCodec>,
    writer: &mut FramedWrite<W, PacketCodec>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    wait_hello(reader).await?;
    send_hello(writer).await?;
    Ok(())
}

async fn send_hello<W>(writer: &mut FramedWrite<W, PacketCodec>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.send(Packet::hello()).await?;
    debug!("Hello sent");
    Ok(())
}

/// Read the first frame and require it to be Hello. Returns its payload.
async fn wait_hello<R>(reader: &mut FramedRead<R, PacketCodec>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(Ok(packet)) if packet.packet_type == PacketType::Hello => {
            info!(payload = %String::from_utf8_lossy(&packet.payload), "Received hello");
            Ok(packet.payload)
        }
        Some(Ok(packet)) => Err(TunnelError::HandshakeError(format!(
            "expected hello packet, got type {}",
            packet.packet_type
        ))),
        Some(Err(e)) => Err(TunnelError::HandshakeError(e.to_string())),
        None => Err(TunnelError::HandshakeError(
            constants::ERR_HANDSHAKE_NO_HELLO.to_string(),
        )),
    }
}
