//! Support for tracing execution of a program.

use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

/// What we log when `RUST_LOG` isn't set. Our status messages go to stdout,
/// so only problems are worth showing by default.
const DEFAULT_FILTER: &str = "warn";

/// Set up the `tracing` library with reasonable options. Log output goes to
/// standard error, and can be controlled with `RUST_LOG`.
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
}
