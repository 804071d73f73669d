//! Diagnostic logging setup for the binary.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's job. `RUST_LOG` wins when set, otherwise the configured level
//! applies to this crate (raised to `debug` by `debug_logging`).
//! Logs go to stderr so stdout stays clean for command output.

use crate::config::Settings;
use tracing_subscriber::EnvFilter;

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(settings: &Settings) -> String {
    format!("avifier={}", settings.effective_log_level())
}

fn filter(settings: &Settings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(settings)))
}

/// Install the global fmt subscriber. A second call is a no-op.
pub fn init(settings: &Settings) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(settings))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}
