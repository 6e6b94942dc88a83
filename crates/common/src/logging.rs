//! Logging setup for vipcare components.

use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize human-readable logging. Levels are controlled through
/// `RUST_LOG`; the default is `info`.
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter()).init();
}

/// Initialize JSON logging for log collectors.
pub fn init_json() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter())
        .init();
}
