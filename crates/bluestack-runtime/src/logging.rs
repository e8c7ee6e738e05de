//! Tracing subscriber setup for binaries and tests

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber at `level`, tagging lines with the executor
/// thread name. Returns `false` if a global subscriber was already set.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

/// Like [`init_tracing`] but honours `RUST_LOG`, falling back to `default_filter`
pub fn init_tracing_from_env(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
