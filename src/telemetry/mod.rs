//! Tracing setup for binaries and tests.
//!
//! The engine itself only emits `tracing` events; embedding applications
//! decide where they go. [`init_tracing`] wires up a sensible default:
//! env-filtered fmt output on stderr with ANSI color when attached to a
//! terminal, plus span traces on errors.

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the default subscriber. Reads `.env` first so `RUST_LOG` can be
/// configured per project; calling it twice is harmless.
pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
}
