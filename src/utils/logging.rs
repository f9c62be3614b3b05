//! Logging initialization for hosts embedding the runtime
//!
//! - Respects the RUST_LOG environment variable, which always wins
//! - Falls back to the `[global.logging]` filter from the configuration
//! - Defaults to `info`
//!
//! # Usage
//! ```rust,no_run
//! use modhost::utils::init_logging;
//!
//! init_logging(Some("modhost=debug"));
//! ```
//!
//! Initialization is first-come: once a global subscriber is installed,
//! later calls are ignored and return `false`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

fn build_filter(filter: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or("info"))
}

/// Human-readable logs on stderr
///
/// # Arguments
/// * `filter` - Optional filter from config (e.g. "info", "modhost::module=debug").
///              Ignored when RUST_LOG is set.
pub fn init_logging(filter: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(build_filter(filter))
        .try_init()
        .is_ok()
}

/// JSON logs for log aggregation
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(build_filter(filter))
        .try_init()
        .is_ok()
}

/// Initialize from the `[global.logging]` section
///
/// `json_format` only takes effect with the `json-logging` feature; without
/// it the human-readable format is used.
pub fn init_logging_from_config(config: Option<&LoggingConfig>) -> bool {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map(|c| c.json_format).unwrap_or(false) {
        #[cfg(feature = "json-logging")]
        {
            return init_json_logging(filter);
        }
    }
    init_logging(filter)
}
