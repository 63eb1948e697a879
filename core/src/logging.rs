//! Structured logging setup.

use tracing_subscriber::EnvFilter;

/// Configure the process-wide subscriber to emit JSON-formatted events.
/// Safe to call more than once; later calls are ignored.
pub fn setup_structured_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init();
}
