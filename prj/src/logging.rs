//! Diagnostic tracing for `prj` runs.
//!
//! Tracing goes to stderr and is never persisted. The durable record of a run
//! is its artifact directory (`io/artifacts`) and the event log
//! (`io/events`), both written regardless of the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "prj=debug,warn" } else { "warn" }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins over `verbose`. Security violations are logged at `error`
/// with `security_violation = true`, so they show at the default level.
///
/// ```bash
/// RUST_LOG=prj::step_exec=debug prj run build
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    // Embedders may have installed a subscriber already; keep theirs.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbose).compact())
        .try_init();
}
