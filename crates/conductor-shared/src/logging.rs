//! # Logging Initialization
//!
//! Structured tracing setup shared by the server binary and tests.
//! Respects `RUST_LOG`; defaults to `info` for conductor crates and `warn`
//! for everything else. `CONDUCTOR_LOG_FORMAT=json` switches to JSON lines
//! for log shippers.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the global tracing subscriber.
///
/// Idempotent - only the first call installs a subscriber, so tests and
/// embedded usage can call it freely.
pub fn init_tracing() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,conductor_shared=info,conductor_orchestration=info,conductor_core=info")
    });

    let json_output = std::env::var("CONDUCTOR_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}
