//! Timestamp and duration helpers

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Whole milliseconds in a duration, saturating at `u64::MAX`
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Seconds elapsed since `since`, clamped at zero
pub fn seconds_since(since: DateTime<Utc>) -> u64 {
    now()
        .signed_duration_since(since)
        .num_seconds()
        .max(0) as u64
}
