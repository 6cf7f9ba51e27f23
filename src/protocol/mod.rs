//! # Multiplexing Engine
//!
//! Everything between the framed transport and the local TCP sockets.
//!
//! ## Components
//! - **Registry**: connection id → socket table
//! - **Correlator**: request ids, waiters and timeouts for InitProxy/Response
//! - **Duplexer**: bounded outgoing queue and the single transport writer
//! - **Dispatcher**: the single transport reader, routing frames by type
//! - **Handshake**: one Hello each way before tunneling starts
//! - **Session**: client listeners, server dialing, per-connection forwarding
//!
//! ## Data Flow
//! ```text
//! TCP read → Data frame → Outbox → Duplexer → Transport
//! Transport → Dispatcher → Registry lookup → TCP write
//!                        → Correlator → waiting request
//! ```

pub mod context;
pub mod correlator;
pub mod dispatcher;
pub mod duplexer;
pub mod handshake;
pub mod ids;
pub mod registry;
pub mod session;

#[cfg(test)]
mod tests;

pub use context::EngineContext;
pub use correlator::{Correlator, ResponsePacket};
pub use dispatcher::Dispatcher;
pub use duplexer::{Duplexer, Outbox};
pub use registry::{ConnectionHandle, ConnectionRegistry};
