//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;

/// Initialize tracing/logging for the process.
///
/// Honors `config.tracing_enabled`; filtering is configurable via `RUST_LOG`.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: &EngineConfig) {
    if !config.tracing_enabled {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .try_init();
}
