//! `tracing` subscriber setup.
//!
//! Library code emits events under the targets `ingest`, `cache`, `storage`, `query`, `pool`,
//! `api` and `config`. [`crate::service::TabularService::from_config`] installs a subscriber
//! with the configured `logging.filter` unless the embedding binary or test already did.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TEST_INIT: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `default_filter` when it is unset.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Idempotent variant for test binaries, writing through the test harness's capture.
pub fn init_for_tests() {
    TEST_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        let _ = init("debug");
        assert!(!init("info"));
    }
}
