use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static LOGGING: OnceLock<()> = OnceLock::new();

/// Installs the process-wide tracing subscriber once.
///
/// Respects `RUST_LOG`; later calls are no-ops, so binaries and tests can
/// both call this unconditionally.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
