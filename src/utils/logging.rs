//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` fmt subscriber. `RUST_LOG` takes
//! precedence over the configured level when it is set.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. Returns false if one was already set.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(config.log_level)));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(config.show_target)
                .with_ansi(config.ansi),
        )
        .with(filter)
        .try_init()
        .is_ok()
}

/// Config with the level raised to DEBUG when `verbose` is set
pub fn with_verbosity(config: &LoggingConfig, verbose: bool) -> LoggingConfig {
    let mut config = config.clone();
    if verbose && config.log_level < Level::DEBUG {
        config.log_level = Level::DEBUG;
    }
    config
}

fn level_directive(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}
