//! Optional tracing setup, gated behind the `telemetry` feature (on by
//! default).
//!
//! This crate never installs a subscriber on its own — logging setup is
//! the host application's call. `init_tracing` is offered as a
//! convenience for binaries/tests that embed this crate directly.

use tracing_subscriber::EnvFilter;

/// Install a global tracing subscriber. `json` selects structured JSON
/// output (suitable for log aggregation) over the default human-readable
/// format. Call at most once, before any other crate API.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive("wac_core=info".parse().expect("valid directive"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
