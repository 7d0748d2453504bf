//! Logging initialization for Etude.
//!
//! The server logs through `tracing`; nothing is printed until a subscriber is
//! installed with one of the functions below.
//!
//! ```bash
//! # Per-connection events (accept, resolve, close)
//! RUST_LOG=debug etude 8080
//!
//! # Only refused clients, dropped requests and fatal errors
//! RUST_LOG=warn etude 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info`, unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level.
///
/// `RUST_LOG`, when set, still wins over `level`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at startup.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}
