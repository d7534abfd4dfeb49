//! Logging bootstrap.
//!
//! Installs the global tracing subscriber from the configuration's logger
//! section. `RUST_LOG` takes precedence over the configured level when set,
//! so a deployment default can still be overridden per invocation.

use tracing_subscriber::EnvFilter;

use crate::config::LoggerConfig;

/// Initializes the global subscriber. Later calls are no-ops, so tests that
/// share a process can call this freely.
pub fn init(config: &LoggerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.pretty {
        builder.pretty().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
