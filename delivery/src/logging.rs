//! Diagnostic tracing for the delivery machine.
//!
//! Build and deploy output never goes through here; it is written to the
//! goal's [`ProgressLog`](crate::io::progress_log::ProgressLog). This module
//! only wires `tracing` events (goal resolution, port allocation, process
//! lifecycle) to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
/// Panics if a global subscriber is already set; use [`try_init`] when
/// embedding.
///
/// ```bash
/// RUST_LOG=delivery=debug my-delivery-machine
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Like [`init`], but returns `false` instead of panicking when a subscriber
/// is already installed.
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}
