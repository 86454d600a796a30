//! Wall-clock helpers.
//!
//! Every handler in this crate takes `now_ms` explicitly so tests can drive
//! time. Drivers use [`now_ms`] to read the real clock.

use std::time::Duration;
use web_time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Whole seconds between two timestamps, rounded up, zero if `to <= from`.
pub fn ceil_secs(from_ms: u64, to_ms: u64) -> u64 {
    to_ms.saturating_sub(from_ms).div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(0, 0), 0);
        assert_eq!(ceil_secs(0, 1), 1);
        assert_eq!(ceil_secs(0, 1000), 1);
        assert_eq!(ceil_secs(0, 1001), 2);
        assert_eq!(ceil_secs(5000, 1000), 0);
    }
}
