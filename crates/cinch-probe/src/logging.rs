//! Tracing subscriber setup for binaries and test hosts.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the embedding program's call. [`init_tracing`] is the stock choice.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable consulted first for the log filter.
pub const LOG_ENV: &str = "CINCH_PROBE_LOG";

/// Resolve the filter: `CINCH_PROBE_LOG`, then `RUST_LOG`, then `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a `fmt` subscriber writing to stderr.
///
/// Returns `false` if a global subscriber was already installed, which is
/// harmless: repeated calls from tests or embedding hosts keep the first.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(default_directive))
        .try_init()
        .is_ok()
}
