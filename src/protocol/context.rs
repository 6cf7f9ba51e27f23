use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::EngineConfig;
use crate::protocol::correlator::Correlator;
use crate::protocol::duplexer::{Outbox, DRAIN_TIMEOUT};
use crate::protocol::registry::ConnectionRegistry;
use crate::utils::Metrics;

/// Handles to the shared engine components, cloned into every task.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub registry: Arc<ConnectionRegistry>,
    pub correlator: Arc<Correlator>,
    pub outbox: Outbox,
    pub metrics: Arc<Metrics>,
    /// Cancelled when the session ends; every task watches it
    pub shutdown: CancellationToken,
    pub read_buffer_size: usize,
}

impl EngineContext {
    pub fn new(
        outbox: Outbox,
        engine: &EngineConfig,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(metrics.clone())),
            correlator: Arc::new(Correlator::new(
                outbox.clone(),
                engine.request_timeout,
                metrics.clone(),
            )),
            outbox,
            metrics,
            shutdown,
            read_buffer_size: engine.read_buffer_size,
        }
    }

    /// End the session: stop every task, close every connection and fail
    /// every pending request.
    ///
    /// With `notify_peer`, a ClosePort for each connection that was still
    /// open is queued for the duplexer to flush, so the peer can release its
    /// side. Queueing is bounded by [`DRAIN_TIMEOUT`].
    /// Returns (connections closed, requests failed).
    pub async fn teardown(&self, notify_peer: bool) -> (usize, usize) {
        self.shutdown.cancel();
        let closed = self.registry.close_all();
        let failed = self.correlator.fail_all();

        if notify_peer && !closed.is_empty() {
            let notify = async {
                for &connection_id in &closed {
                    if let Err(e) = self.outbox.send_close(connection_id).await {
                        warn!(connection_id, error = %e, "Could not queue ClosePort");
                        break;
                    }
                }
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, notify).await.is_err() {
                warn!(connections = closed.len(), "Timed out queueing ClosePort for open connections");
            }
        }

        (closed.len(), failed)
    }
}
