//! Ambient helpers: logging, shutdown signals, timestamps

pub mod logging;
pub mod signal;
pub mod time;

pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use signal::{shutdown_token, wait_for_shutdown_signal, ShutdownSignal};
pub use time::{current_timestamp, current_timestamp_millis};
