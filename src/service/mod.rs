//! # Service Layer
//!
//! Runs a complete tunnel session on top of an opened transport.

pub mod tunnel;

pub use tunnel::Tunnel;
