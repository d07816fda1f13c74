//! Millisecond clock shared by TTL checks, WAL timestamps, and snapshot
//! naming. A single definition keeps every component on the same epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Current unix time in milliseconds, unsigned. Used where timestamps are
/// stored in u64 fields (stats, snapshot headers).
#[inline]
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
