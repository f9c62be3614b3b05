//! Wall-clock helpers
//!
//! Never panic on a clock that sits before the epoch; report zero instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using 0 as timestamp");
            Duration::from_secs(0)
        })
}

/// Seconds since the Unix epoch
pub fn current_timestamp() -> u64 {
    since_epoch().as_secs()
}

/// Milliseconds since the Unix epoch (state-change timestamps)
pub fn current_timestamp_millis() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}
