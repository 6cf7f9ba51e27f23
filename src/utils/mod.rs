//! # Utility Modules
//!
//! Supporting utilities shared by the engine and the binary.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup driven by `LoggingConfig`
//! - **Metrics**: thread-safe counters for frames, connections and requests

pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
