//! Optional tracing subscriber setup, gated behind the `logging` feature.

use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber filtered by `RUST_LOG`.
///
/// Intended for binaries and tests embedding this library; libraries should
/// leave subscriber installation to their host.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
