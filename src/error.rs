//! # Error Types
//!
//! Error handling for the serial multiplexer.
//!
//! This module defines every error variant that can surface from the engine,
//! from low-level transport I/O up to protocol validation and request timeouts.
//!
//! ## Error Categories
//! - **Transport Errors**: I/O failures and framing desynchronization (fatal to a session)
//! - **Connection Errors**: failures scoped to one tunneled TCP connection
//! - **Protocol Errors**: malformed InitProxy, ClosePort or Data payloads
//! - **Request Errors**: correlator timeouts and rejections reported by the peer
//! - **Configuration Errors**: invalid port mappings or settings
//!
//! ## Example Usage
//! ```rust
//! use serial_mux::config::PortMapping;
//! use serial_mux::error::Result;
//! use tracing::{error, info};
//!
//! fn parse(raw: &str) -> Result<PortMapping> {
//!     raw.parse::<PortMapping>()
//! }
//!
//! match parse("8080-9090") {
//!     Ok(mapping) => info!(%mapping, "Parsed mapping"),
//!     Err(e) => error!(error = %e, "Bad mapping"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_TRANSPORT_CLOSED: &str = "Transport closed by peer";

    /// Handshake errors
    pub const ERR_HANDSHAKE_NO_HELLO: &str = "Transport closed before hello was received";

    /// Engine lifecycle errors
    pub const ERR_QUEUE_CLOSED: &str = "Outgoing packet queue is closed";
    pub const ERR_WAITER_DROPPED: &str = "Response waiter dropped before a reply arrived";

    /// Payload validation errors
    pub const ERR_DATA_TOO_SHORT: &str = "Data payload shorter than connection id";
    pub const ERR_MALFORMED_RESPONSE: &str = "Malformed response body";

    /// Response messages sent back to the peer
    pub const MSG_PROXY_INITIALIZED: &str = "proxy initialized successfully";
    pub const MSG_INVALID_PAYLOAD: &str = "invalid payload format";
}

/// Primary error type for all engine operations
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload too large: {0} bytes (maximum 65535)")]
    OversizedPayload(usize),

    #[error("Truncated frame: expected {expected} bytes, transport ended after {received}")]
    TruncatedFrame { expected: usize, received: usize },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Request {0} timed out")]
    Timeout(u32),

    #[error("Request rejected by peer: {0}")]
    RequestRejected(String),

    #[error("Invalid InitProxy payload: {0}")]
    InvalidInitProxy(String),

    #[error("Invalid ClosePort payload: {0}")]
    InvalidClosePort(String),

    #[error("Payload of {0} bytes is shorter than its 4-byte id prefix")]
    ShortPayload(usize),

    #[error("Connection id {0} is already registered")]
    DuplicateConnection(u32),

    #[error("Invalid port mapping: {0}")]
    InvalidMapping(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Engine closed: {0}")]
    EngineClosed(&'static str),
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
