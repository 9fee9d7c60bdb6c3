//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Select text or JSON output
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - Init failures (a subscriber already set, e.g. in tests) are ignored

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::schema::ObservabilityConfig;

/// Install the global tracing subscriber.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.log_format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
