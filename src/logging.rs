//! Tracing subscriber setup.
//!
//! `HARNESS_LOG` takes precedence over `[logging].filter`, e.g.
//! `HARNESS_LOG=vet_harness=debug,harness_core=debug,tower_http=info`.
//! Logs go to stderr so CLI output on stdout stays machine-readable.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("HARNESS_LOG")
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A subscriber may already be installed (tests, embedding callers).
    let result = if config.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
