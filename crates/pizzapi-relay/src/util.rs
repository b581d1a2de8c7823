//! Small shared helpers.

use chrono::Utc;

/// Current time as unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `now + ttl` as unix milliseconds.
pub fn deadline_ms(ttl: std::time::Duration) -> i64 {
    now_ms() + ttl.as_millis() as i64
}
