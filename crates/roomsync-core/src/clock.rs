//! Wall-clock timestamps stamped on outbound frames.

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
