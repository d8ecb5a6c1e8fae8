/// Tracing setup for embedding applications
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Call once at startup;
/// repeated calls are ignored.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
