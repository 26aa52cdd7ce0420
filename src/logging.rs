//! Process-wide tracing setup for harness binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber: human-readable output, filtered by
/// `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are no-ops. Library code only
/// emits [tracing] events and never installs a subscriber on its own, so a
/// harness embedding this crate is free to skip this and bring its own.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
