//! Diagnostic tracing for the engine.
//!
//! Output goes to stderr and is not part of any product output: session
//! records and `status`/`export` JSON on stdout stay machine-readable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. When unset, defaults to `warn`, or `engager=info` when
/// `verbose` is set. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=engager=debug engager run https://example.com/posts/42
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,engager=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
