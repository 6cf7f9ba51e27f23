//! Tunnel session
//!
//! Wires the engine together over one transport: handshake, duplexer,
//! dispatcher and (in client role) one listener per mapping. The session
//! ends when the transport fails or the shutdown token is cancelled; either
//! way every connection is closed and every pending request failed before
//! `run` returns. After a requested shutdown the peer is also sent a
//! ClosePort for each connection that was still open, since a serial link
//! never reports end of stream.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{Role, TunnelConfig};
use crate::core::codec::PacketCodec;
use crate::error::Result;
use crate::protocol::handshake::handshake;
use crate::protocol::{duplexer, session, Dispatcher, Duplexer, EngineContext};
use crate::transport::Transport;
use crate::utils::Metrics;

pub struct Tunnel {
    config: TunnelConfig,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(Metrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the tunnel when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Run one session over `transport`.
    ///
    /// Returns `Ok(())` after a requested shutdown and the fatal error when
    /// the handshake or the transport fails.
    #[instrument(skip_all, fields(role = %self.config.role))]
    pub async fn run<T: Transport>(&self, transport: T) -> Result<()> {
        let role = self.config.role;
        let (read_half, write_half) = tokio::io::split(transport);
        let mut frames = FramedRead::new(read_half, PacketCodec);
        let mut sink = FramedWrite::new(write_half, PacketCodec);

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested before handshake completed");
                return Ok(());
            }
            result = handshake(role, &mut frames, &mut sink) => {
                if let Err(e) = result {
                    error!(error = %e, "Handshake failed");
                    return Err(e);
                }
            }
        }
        info!("Handshake complete, tunnel established");

        // The writer outlives the session so teardown frames still get out
        let session_token = self.shutdown.child_token();
        let writer_token = CancellationToken::new();
        let (outbox, rx) = duplexer::channel(self.config.engine.queue_capacity);
        let writer = Duplexer::new(sink, rx, self.metrics.clone(), writer_token.clone()).spawn();
        let ctx = EngineContext::new(
            outbox,
            &self.config.engine,
            self.metrics.clone(),
            session_token,
        );

        let mut listeners = JoinSet::new();
        if role == Role::Client {
            for mapping in &self.config.mappings {
                match session::bind_mapping(mapping).await {
                    Ok(listener) => {
                        listeners.spawn(session::serve_mapping(
                            ctx.clone(),
                            listener,
                            Arc::new(mapping.clone()),
                        ));
                    }
                    Err(e) => {
                        error!(%mapping, error = %e, "Failed to listen on local port");
                    }
                }
            }
        }

        let result = Dispatcher::new(ctx.clone(), role).run(frames).await;

        let (closed, failed) = ctx.teardown(result.is_ok()).await;
        info!(
            connections_closed = closed,
            requests_failed = failed,
            "Tunnel session torn down"
        );

        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
        drop(ctx);
        writer_token.cancel();
        if let Err(e) = writer.await {
            warn!(error = %e, "Duplexer task ended abnormally");
        }

        self.metrics.log_summary();
        result
    }
}
