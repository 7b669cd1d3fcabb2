//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Environment variable consulted before the configured level.
pub const LOG_ENV: &str = "STRATA_LOG";

/// Install a global `fmt` subscriber.
///
/// `STRATA_LOG` takes precedence over `level`. Calling this more than once
/// is harmless; later calls are ignored.
pub fn init(level: LogLevel) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
