//! ## numadp-telemetry::logging
//! **`tracing` subscriber setup**
//!
//! ### Expectations:
//! - `RUST_LOG` overrides the configured directive
//! - Thread names on every line, so per-node init threads are identifiable

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. Returns `false` if one was already set.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .compact()
        .try_init()
        .is_ok()
}
