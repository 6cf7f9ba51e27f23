//! # serial-mux
//!
//! Multiplexes many independent TCP connections over one reliable byte
//! stream, typically a serial line, between two cooperating processes.
//!
//! The **client** listens on local TCP ports. Each accepted connection is
//! announced to the **server** with an InitProxy request; the server dials
//! the requested target and the bytes of both sockets are relayed as Data
//! frames tagged with a connection id.
//!
//! ## Layers
//! - [`core`]: frame format and the tokio codec
//! - [`protocol`]: registry, correlator, duplexer, dispatcher, handshake
//! - [`service`]: the tunnel runner
//! - [`transport`]: opening the serial (or TCP) link
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{PortMapping, Role, TunnelConfig};
pub use crate::core::packet::{Packet, PacketType};
pub use crate::error::{Result, TunnelError};
pub use crate::service::Tunnel;
