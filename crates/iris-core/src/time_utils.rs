use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp in milliseconds, saturating on clock skew.
pub fn current_unix_timestamp_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
