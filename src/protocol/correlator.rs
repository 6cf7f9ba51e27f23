//! Request/response correlator
//!
//! Control operations (currently only InitProxy) are requests that expect a
//! Response frame. Each request gets an id from its own counter, prefixed to
//! the payload as 4 big-endian bytes, and a single-slot waiter. The matching
//! Response fills the waiter exactly once; a request with no reply within the
//! timeout fails and its waiter is removed, so a late reply is dropped.
//! Responses are matched on the 4-byte prefix, so a body that cannot be
//! decoded still settles its request as a failure.
//!
//! ## Response wire format
//! ```text
//! [RequestID(4, big-endian)] [JSON {"requestID": u32, "success": bool, "message": str}]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::core::packet::{prefix_id, split_id, Packet, PacketType};
use crate::error::{constants, Result, TunnelError};
use crate::protocol::duplexer::Outbox;
use crate::protocol::ids::IdGenerator;
use crate::utils::Metrics;

/// Structured body of a Response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePacket {
    #[serde(rename = "requestID")]
    pub request_id: u32,
    pub success: bool,
    pub message: String,
}

impl ResponsePacket {
    pub fn new(request_id: u32, success: bool, message: impl Into<String>) -> Self {
        Self {
            request_id,
            success,
            message: message.into(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        Ok(prefix_id(self.request_id, &body))
    }

    /// Decode a Response payload. The envelope prefix is authoritative for
    /// the request id; a disagreeing id in the body is logged and replaced.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let (request_id, body) = split_id(payload)?;
        Self::from_body(request_id, body)
    }

    fn from_body(request_id: u32, body: &[u8]) -> Result<Self> {
        let mut response: ResponsePacket = serde_json::from_slice(body)?;
        if response.request_id != request_id {
            warn!(
                request_id,
                body_id = response.request_id,
                "Response body id does not match envelope"
            );
            response.request_id = request_id;
        }
        Ok(response)
    }

    /// Turn a failure response into `RequestRejected`
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(TunnelError::RequestRejected(self.message))
        }
    }
}

type PendingMap = HashMap<u32, oneshot::Sender<ResponsePacket>>;

/// Matches Response frames to in-flight requests.
#[derive(Debug)]
pub struct Correlator {
    ids: IdGenerator,
    pending: Arc<Mutex<PendingMap>>,
    outbox: Outbox,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

/// Removes a waiter when the request finishes or its future is dropped.
struct PendingGuard {
    pending: Arc<Mutex<PendingMap>>,
    request_id: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

impl Correlator {
    pub fn new(outbox: Outbox, timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            ids: IdGenerator::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbox,
            timeout,
            metrics,
        }
    }

    pub fn next_request_id(&self) -> u32 {
        self.ids.next_id()
    }

    /// Send a request frame and wait for its response.
    ///
    /// A failure response is returned as `Ok` with `success == false`; use
    /// [`ResponsePacket::into_result`] to treat it as an error.
    #[instrument(skip(self, payload), fields(request_id))]
    pub async fn send_request(
        &self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<ResponsePacket> {
        let request_id = self.next_request_id();
        tracing::Span::current().record("request_id", request_id);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            request_id,
        };

        self.outbox
            .send(Packet::new(packet_type, prefix_id(request_id, payload)))
            .await?;
        self.metrics.request_sent();
        debug!(%packet_type, "Request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TunnelError::EngineClosed(constants::ERR_WAITER_DROPPED)),
            Err(_) => {
                self.metrics.request_timed_out();
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                Err(TunnelError::Timeout(request_id))
            }
        }
    }

    /// Hand a Response frame to its waiter.
    ///
    /// Returns `Ok(false)` when nobody is waiting (timed out or unknown id).
    /// A body that does not decode is handed over as a failure response
    /// carrying the decode error, and the error is also returned.
    pub fn deliver_response(&self, payload: &[u8]) -> Result<bool> {
        let (request_id, body) = split_id(payload)?;
        let (response, decode_error) = match ResponsePacket::from_body(request_id, body) {
            Ok(response) => (response, None),
            Err(e) => {
                let message = format!("{}: {e}", constants::ERR_MALFORMED_RESPONSE);
                (ResponsePacket::new(request_id, false, message), Some(e))
            }
        };

        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);

        let delivered = match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        };

        if delivered {
            self.metrics.response_delivered();
            debug!(request_id, "Response delivered");
        } else {
            self.metrics.response_discarded();
            warn!(request_id, "No pending request for response, discarding");
        }

        match decode_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Queue a Response frame for a request received from the peer.
    /// One-way: nothing waits for it.
    pub async fn send_response(&self, request_id: u32, success: bool, message: &str) -> Result<()> {
        let response = ResponsePacket::new(request_id, success, message);
        self.outbox
            .send(Packet::new(PacketType::Response, response.to_payload()?))
            .await
    }

    /// Fail every in-flight request; used on shutdown.
    pub fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
