//! Proxy session manager
//!
//! Role-specific connection setup plus the per-connection forwarding reader
//! shared by both roles.
//!
//! - **Client**: listens on each mapping's local address. Every accepted
//!   socket gets a fresh connection id, is registered, and is announced to
//!   the peer with an InitProxy request. A rejected or timed-out request
//!   closes the socket; a successful one starts forwarding.
//! - **Server**: reacts to InitProxy by dialing the requested target,
//!   registering it under the client's connection id, answering, and then
//!   forwarding.
//!
//! ## InitProxy payload
//! ```text
//! remoteHost:remotePort:localHost:localPort:connectionID
//! ```
//! Field names are from the server's point of view: "remote" is the
//! client's listening side, "local" is the target the server dials.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PortMapping;
use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, Result, TunnelError};
use crate::protocol::context::EngineContext;
use crate::protocol::registry::ConnectionHandle;

/// Decoded InitProxy request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProxyRequest {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub connection_id: u32,
}

impl InitProxyRequest {
    /// Request the peer to reach `mapping`'s remote side for `connection_id`
    pub fn for_mapping(mapping: &PortMapping, connection_id: u32) -> Self {
        Self {
            remote_host: mapping.local_host.clone(),
            remote_port: mapping.local_port,
            local_host: mapping.remote_host.clone(),
            local_port: mapping.remote_port,
            connection_id,
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|_| TunnelError::InvalidInitProxy("payload is not UTF-8".to_string()))?;

        let fields: Vec<&str> = text.split(':').collect();
        let [remote_host, remote_port, local_host, local_port, connection_id] = fields[..] else {
            return Err(TunnelError::InvalidInitProxy(format!(
                "expected 5 colon-delimited fields, got {}",
                fields.len()
            )));
        };

        Ok(Self {
            remote_host: remote_host.to_string(),
            remote_port: parse_field(remote_port, "remote port")?,
            local_host: local_host.to_string(),
            local_port: parse_field(local_port, "local port")?,
            connection_id: parse_field(connection_id, "connection id")?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

impl fmt::Display for InitProxyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.remote_host, self.remote_port, self.local_host, self.local_port, self.connection_id
        )
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TunnelError::InvalidInitProxy(format!("invalid {name}: {value:?}")))
}

/// Bind the local listener for a mapping
pub async fn bind_mapping(mapping: &PortMapping) -> Result<TcpListener> {
    let listener = TcpListener::bind(mapping.local_addr()).await?;
    info!(
        local = %mapping.local_addr(),
        remote = %mapping.remote_addr(),
        "Listening, proxying to remote"
    );
    Ok(listener)
}

/// Client role: accept connections on `listener` until shutdown.
#[instrument(name = "listener", skip_all, fields(mapping = %mapping))]
pub async fn serve_mapping(ctx: EngineContext, listener: TcpListener, mapping: Arc<PortMapping>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                debug!("Shutdown signalled, listener stopping");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(proxy_accepted(ctx.clone(), mapping.clone(), stream, peer));
            }
            Err(e) => {
                error!(error = %e, "Error accepting connection");
            }
        }
    }
}

/// Client role: announce one accepted socket and forward it on success.
#[instrument(skip(ctx, mapping, stream), fields(connection_id))]
async fn proxy_accepted(
    ctx: EngineContext,
    mapping: Arc<PortMapping>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let connection_id = ctx.registry.next_connection_id();
    tracing::Span::current().record("connection_id", connection_id);

    let (reader, writer) = stream.into_split();
    let handle = ConnectionHandle::new(writer);
    let closed = handle.closed();
    if let Err(e) = ctx.registry.register(connection_id, handle) {
        error!(error = %e, "Failed to register connection");
        return;
    }

    let request = InitProxyRequest::for_mapping(&mapping, connection_id);
    let outcome = ctx
        .correlator
        .send_request(PacketType::InitProxy, &request.encode())
        .await
        .and_then(|response| response.into_result());

    match outcome {
        Ok(_) => {
            debug!(%mapping, "Proxy initialized");
            forward_connection(ctx, connection_id, reader, closed).await;
        }
        Err(e) => {
            warn!(%mapping, error = %e, "Failed to init proxy");
            ctx.registry.remove(connection_id);
            // The peer may still complete the dial after we gave up
            if matches!(e, TunnelError::Timeout(_)) {
                if let Err(e) = ctx.outbox.send_close(connection_id).await {
                    warn!(error = %e, "Could not queue ClosePort");
                }
            }
        }
    }
}

/// Server role: handle an InitProxy frame.
///
/// Malformed payloads and dial failures produce a failure Response and leave
/// no connection behind. On success the Response is queued before the
/// forwarding reader starts, so the peer learns about the connection before
/// any of its Data frames.
#[instrument(name = "init_proxy", skip_all, fields(request_id, connection_id))]
pub async fn handle_init_proxy(ctx: EngineContext, packet: Packet) {
    let (request_id, body) = match packet.split_id() {
        Ok(parts) => parts,
        Err(_) => {
            ctx.metrics.invalid_frame();
            warn!("InitProxy payload too short to carry a request id");
            return;
        }
    };
    tracing::Span::current().record("request_id", request_id);

    let request = match InitProxyRequest::parse(body) {
        Ok(request) => request,
        Err(e) => {
            ctx.metrics.invalid_frame();
            warn!(error = %e, "Malformed InitProxy");
            let message = format!("{}: {e}", constants::MSG_INVALID_PAYLOAD);
            respond(&ctx, request_id, false, &message).await;
            return;
        }
    };
    let connection_id = request.connection_id;
    tracing::Span::current().record("connection_id", connection_id);
    info!(target_addr = %request.target_addr(), "Initiating proxy");

    if ctx.registry.contains(connection_id) {
        let message = TunnelError::DuplicateConnection(connection_id).to_string();
        respond(&ctx, request_id, false, &message).await;
        return;
    }

    let stream = match TcpStream::connect(request.target_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Dial failed");
            let message = format!("failed to dial {}: {e}", request.target_addr());
            respond(&ctx, request_id, false, &message).await;
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    let handle = ConnectionHandle::new(writer);
    let closed = handle.closed();
    if let Err(e) = ctx.registry.register(connection_id, handle) {
        respond(&ctx, request_id, false, &e.to_string()).await;
        return;
    }

    if let Err(e) = ctx
        .correlator
        .send_response(request_id, true, constants::MSG_PROXY_INITIALIZED)
        .await
    {
        warn!(error = %e, "Could not queue InitProxy response");
        ctx.registry.remove(connection_id);
        return;
    }

    tokio::spawn(forward_connection(ctx, connection_id, reader, closed));
}

async fn respond(ctx: &EngineContext, request_id: u32, success: bool, message: &str) {
    if let Err(e) = ctx.correlator.send_response(request_id, success, message).await {
        warn!(request_id, error = %e, "Could not queue response");
    }
}

/// Relay local socket reads to the peer as Data frames.
///
/// Ends on local EOF, a local read error or a failure to queue data (the
/// connection is removed and a ClosePort naming `connection_id` is sent),
/// when the peer closes the connection (`closed` is cancelled), or on
/// shutdown.
#[instrument(name = "forwarder", skip(ctx, reader, closed))]
pub async fn forward_connection<R>(
    ctx: EngineContext,
    connection_id: u32,
    mut reader: R,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; ctx.read_buffer_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                debug!("Connection closed by peer");
                return;
            }
            _ = ctx.shutdown.cancelled() => {
                debug!("Shutdown signalled, forwarder stopping");
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("Local connection reached EOF");
                break;
            }
            Ok(n) => {
                if let Err(e) = ctx.outbox.send_data(connection_id, &buf[..n]).await {
                    warn!(error = %e, "Could not queue data frame");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading from TCP connection");
                break;
            }
        }
    }

    if ctx.registry.remove(connection_id) {
        if let Err(e) = ctx.outbox.send_close(connection_id).await {
            warn!(error = %e, "Could not queue ClosePort");
        }
    }
}
