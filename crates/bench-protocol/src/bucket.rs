/// Fixed-width time windows.
///
/// A window of width `w` covers the half-open interval `[k·w, (k+1)·w)`.
/// Two timestamps share a window iff their integer division by `w` is equal.

use chrono::{DateTime, SecondsFormat};

/// Start of the window containing `timestamp_ms`.
///
/// A zero width is treated as one millisecond so the function stays total.
#[inline]
pub fn window_start(timestamp_ms: u64, width_ms: u64) -> u64 {
    let width = width_ms.max(1);
    (timestamp_ms / width) * width
}

/// Canonical RFC 3339 rendering of a window start, e.g. `2021-04-03T23:09:30.000Z`.
pub fn window_key(window_start_ms: u64) -> String {
    match DateTime::from_timestamp_millis(window_start_ms as i64) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => window_start_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_in_same_window() {
        let w = 10_000;
        assert_eq!(window_start(10_001_001, w), 10_000_000);
        assert_eq!(window_start(10_005_321, w), 10_000_000);
        assert_eq!(window_start(10_009_999, w), 10_000_000);
        assert_eq!(window_start(10_010_000, w), 10_010_000);
    }

    #[test]
    fn test_window_start_is_idempotent() {
        for &(t, w) in &[(0u64, 1u64), (1, 1000), (999, 1000), (1_617_491_370_123, 1000), (77, 7)] {
            let once = window_start(t, w);
            assert_eq!(window_start(once, w), once);
            assert!(once <= t && t < once + w);
        }
    }

    #[test]
    fn test_zero_width_does_not_panic() {
        assert_eq!(window_start(1234, 0), 1234);
    }

    #[test]
    fn test_window_key_format() {
        assert_eq!(window_key(1_617_491_370_000), "2021-04-03T23:09:30.000Z");
        assert_eq!(window_key(0), "1970-01-01T00:00:00.000Z");
    }
}
