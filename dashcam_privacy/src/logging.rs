use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global `tracing` subscriber. Honours `RUST_LOG`, defaults to `info`.
/// Later calls are no-ops.
pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed, e.g. by a test harness.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
