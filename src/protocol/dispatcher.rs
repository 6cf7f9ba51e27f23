//! Inbound frame dispatcher
//!
//! The single reader of the transport. Frames are decoded strictly in order
//! and routed by type; the dispatcher itself keeps no state beyond the
//! shared registry and correlator. Work done inline per frame is limited to
//! a map lookup and a local socket write, while InitProxy handling (which
//! dials) runs on its own task.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::Role;
use crate::core::codec::PacketCodec;
use crate::core::packet::{split_id, Packet, PacketType};
use crate::error::{constants, Result, TunnelError};
use crate::protocol::context::EngineContext;
use crate::protocol::session;

/// Routes inbound frames for one side of the link.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    ctx: EngineContext,
    role: Role,
}

impl Dispatcher {
    pub fn new(ctx: EngineContext, role: Role) -> Self {
        Self { ctx, role }
    }

    /// Read and dispatch frames until the transport fails or shutdown.
    ///
    /// A decode error, truncated frame or end of stream is returned as an
    /// error: a byte stream without frame markers cannot be resynchronized.
    /// Shutdown through the context token returns `Ok(())`.
    #[instrument(name = "dispatcher", skip_all, fields(role = %self.role))]
    pub async fn run<R>(&self, mut frames: FramedRead<R, PacketCodec>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => {
                    info!("Shutdown signalled, dispatcher stopping");
                    return Ok(());
                }
                next = frames.next() => next,
            };

            match next {
                Some(Ok(packet)) => {
                    self.ctx.metrics.frame_received(packet.encoded_len() as u64);
                    self.dispatch(packet).await;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Error reading packet");
                    return Err(e);
                }
                None => {
                    error!("Transport closed");
                    return Err(TunnelError::TransportError(
                        constants::ERR_TRANSPORT_CLOSED.to_string(),
                    ));
                }
            }
        }
    }

    /// Route one frame. Errors are logged and confined to the frame.
    pub async fn dispatch(&self, packet: Packet) {
        trace!(
            packet_type = %packet.packet_type,
            bytes = packet.payload.len(),
            "Read serial packet"
        );

        match packet.packet_type {
            PacketType::Hello => {
                info!(payload = %String::from_utf8_lossy(&packet.payload), "Received hello");
            }
            PacketType::InitProxy => self.handle_init_proxy(packet).await,
            PacketType::Data => self.handle_data(&packet.payload).await,
            PacketType::ClosePort => self.handle_close_port(&packet.payload),
            PacketType::Response => {
                if let Err(e) = self.ctx.correlator.deliver_response(&packet.payload) {
                    self.ctx.metrics.invalid_frame();
                    warn!(error = %e, "Error decoding response packet");
                }
            }
            PacketType::Unknown(kind) => {
                self.ctx.metrics.invalid_frame();
                warn!(packet_type = kind, "Unknown packet type");
            }
        }
    }

    async fn handle_init_proxy(&self, packet: Packet) {
        match self.role {
            Role::Server => {
                tokio::spawn(session::handle_init_proxy(self.ctx.clone(), packet));
            }
            Role::Client => {
                self.ctx.metrics.invalid_frame();
                warn!("InitProxy received in client role, rejecting");
                if let Ok((request_id, _)) = packet.split_id() {
                    let message = "init proxy is not accepted by a client";
                    if let Err(e) = self
                        .ctx
                        .correlator
                        .send_response(request_id, false, message)
                        .await
                    {
                        warn!(request_id, error = %e, "Could not queue response");
                    }
                }
            }
        }
    }

    async fn handle_data(&self, payload: &[u8]) {
        let (connection_id, data) = match split_id(payload) {
            Ok(parts) => parts,
            Err(_) => {
                self.ctx.metrics.invalid_frame();
                warn!(
                    bytes = payload.len(),
                    "{}",
                    constants::ERR_DATA_TOO_SHORT
                );
                return;
            }
        };

        let Some(handle) = self.ctx.registry.lookup(connection_id) else {
            debug!(connection_id, "No connection found for data, dropping");
            return;
        };

        trace!(connection_id, bytes = data.len(), "Writing data to connection");
        if let Err(e) = handle.write_all(data).await {
            warn!(connection_id, error = %e, "Error writing to TCP connection");
        }
    }

    fn handle_close_port(&self, payload: &[u8]) {
        let connection_id = match parse_close_port(payload) {
            Ok(id) => id,
            Err(e) => {
                self.ctx.metrics.invalid_frame();
                warn!(error = %e, "Invalid close port packet");
                return;
            }
        };

        if self.ctx.registry.remove(connection_id) {
            debug!(connection_id, "Connection closed by peer");
        } else {
            debug!(connection_id, "No connection found for close port");
        }
    }
}

/// Parse a ClosePort payload: the decimal ASCII connection id
pub fn parse_close_port(payload: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| TunnelError::InvalidClosePort("payload is not UTF-8".to_string()))?;
    text.trim()
        .parse::<u32>()
        .map_err(|_| TunnelError::InvalidClosePort(format!("not a connection id: {text:?}")))
}
