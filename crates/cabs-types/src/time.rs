//! Anchor timestamps.
//!
//! Anchors are stamped with absolute instants at nanosecond resolution.
//! Instants are compared, never their wall-clock renderings, so the time zone
//! of a parsed timestamp is not part of its identity.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::TypeError;

/// An absolute instant with nanosecond resolution.
pub type Timestamp = DateTime<Utc>;

/// Nanoseconds since the Unix epoch of [`max_time`].
pub const MAX_NANOS: i64 = i64::MAX;

/// The latest instant that can be stamped on an anchor.
///
/// This is the largest instant expressible as signed 64-bit nanoseconds since
/// the Unix epoch (2262-04-11T23:47:16.854775807Z). Object-store keys encode
/// `MAX_NANOS - nanos(at)` so that lexical key order is descending time
/// order; every replica must agree on this value for keys to be portable.
pub fn max_time() -> Timestamp {
    Utc.timestamp_nanos(MAX_NANOS)
}

/// The current instant.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Nanoseconds since the Unix epoch.
///
/// Fails for instants outside the signed 64-bit nanosecond range
/// (roughly 1677 through 2262).
pub fn to_nanos(at: &Timestamp) -> Result<i64, TypeError> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| TypeError::TimeOutOfRange(at.to_rfc3339()))
}

/// Like [`to_nanos`], but clamps instants outside the representable range
/// to its ends. Suitable for lookups, where "after MAX_TIME" behaves as
/// MAX_TIME.
pub fn saturating_nanos(at: &Timestamp) -> i64 {
    match at.timestamp_nanos_opt() {
        Some(n) => n,
        None if at.timestamp() > 0 => i64::MAX,
        None => i64::MIN,
    }
}

/// Inverse of [`to_nanos`].
pub fn from_nanos(nanos: i64) -> Timestamp {
    Utc.timestamp_nanos(nanos)
}

/// Layouts accepted by [`parse_timestamp`] after RFC 3339 fails.
/// Zone-less layouts are interpreted as UTC.
const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const ZONED_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%a, %d %b %Y %H:%M:%S %z",
];

/// Parse a user-supplied timestamp.
///
/// Accepts RFC 3339 (with optional fractional seconds down to nanoseconds),
/// RFC 2822-style `Mon, 02 Jan 2006 15:04:05 -0700`, a space-separated
/// date-time with or without a numeric offset, and a bare `YYYY-MM-DD` date
/// (midnight UTC).
pub fn parse_timestamp(s: &str) -> Result<Timestamp, TypeError> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for layout in ZONED_LAYOUTS {
        if let Ok(t) = DateTime::parse_from_str(s, layout) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, layout) {
            return Ok(t.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }
    Err(TypeError::InvalidTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn max_time_is_i64_nanos() {
        let max = max_time();
        assert_eq!(to_nanos(&max).unwrap(), i64::MAX);
        assert_eq!(max.to_rfc3339(), "2262-04-11T23:47:16.854775807+00:00");
    }

    #[test]
    fn nanos_roundtrip() {
        let t = parse_timestamp("1977-08-05T12:00:00.123456789-04:00").unwrap();
        assert_eq!(from_nanos(to_nanos(&t).unwrap()), t);
    }

    #[test]
    fn out_of_range_instant_is_rejected() {
        let far = max_time() + Duration::days(1);
        assert!(matches!(to_nanos(&far), Err(TypeError::TimeOutOfRange(_))));
    }

    #[test]
    fn saturating_clamps() {
        let far = max_time() + Duration::days(1);
        assert_eq!(saturating_nanos(&far), i64::MAX);
        let early = from_nanos(i64::MIN) - Duration::days(1);
        assert_eq!(saturating_nanos(&early), i64::MIN);
        assert_eq!(saturating_nanos(&from_nanos(42)), 42);
    }

    #[test]
    fn rfc3339_offset_is_normalized() {
        let a = parse_timestamp("1977-08-05T12:00:00-04:00").unwrap();
        let b = parse_timestamp("1977-08-05T16:00:00Z").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn common_layouts() {
        let expected = parse_timestamp("2024-03-01T10:20:30Z").unwrap();
        assert_eq!(parse_timestamp("2024-03-01 10:20:30").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T10:20:30").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01 10:20:30 +0000").unwrap(), expected);
        assert_eq!(
            parse_timestamp("Fri, 01 Mar 2024 10:20:30 +0000").unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap(),
            parse_timestamp("2024-03-01T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(TypeError::InvalidTimestamp(_))
        ));
    }
}
