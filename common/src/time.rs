use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in epoch milliseconds.
///
/// Domain code never reads the clock itself; callers sample here once and
/// pass `now_ms` explicitly so state transitions stay deterministic in tests.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
