//! Wall-clock helpers.
//!
//! Everything that crosses a process boundary (audit rows, shared-store
//! records, latency samples) is stamped in Unix milliseconds so that
//! instances never need to agree on a monotonic clock.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Milliseconds in one rate-limit window.
pub const MINUTE_MS: i64 = 60_000;

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Start of the one-minute window containing `ts_ms`.
pub fn minute_bucket(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(MINUTE_MS)
}

/// Milliseconds until the window containing `ts_ms` rolls over.
pub fn ms_until_next_minute(ts_ms: i64) -> i64 {
    minute_bucket(ts_ms) + MINUTE_MS - ts_ms
}

/// RFC 3339 rendering with millisecond precision, as used on the wire.
pub fn to_rfc3339(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    to_rfc3339(now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_bucket_floors() {
        assert_eq!(minute_bucket(0), 0);
        assert_eq!(minute_bucket(59_999), 0);
        assert_eq!(minute_bucket(60_000), 60_000);
        assert_eq!(minute_bucket(125_000), 120_000);
    }

    #[test]
    fn ms_until_next_minute_counts_down() {
        assert_eq!(ms_until_next_minute(0), 60_000);
        assert_eq!(ms_until_next_minute(59_000), 1_000);
        assert_eq!(ms_until_next_minute(61_500), 58_500);
    }

    #[test]
    fn rfc3339_rendering() {
        assert_eq!(to_rfc3339(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(to_rfc3339(1_500), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
