//! Anchor history resolution and object-store key encoding.
//!
//! Resolution answers "which ref did `name` designate at `t`": the entry
//! with the greatest `at <= t`. An entry stamped exactly `t` wins over its
//! predecessors.
//!
//! Stores that can only list keys lexically encode ordering into the key.
//! Anchor keys carry `MAX_NANOS - nanos(at)` as a zero-padded 20-digit
//! decimal, so listing a name's prefix returns its history newest first.

use cabs_types::time::{from_nanos, to_nanos};
use cabs_types::{Ref, Timestamp, TypeError, MAX_NANOS};

/// Prefix of every blob key.
pub const BLOB_KEY_PREFIX: &str = "b:";

/// Prefix of every anchor key.
pub const ANCHOR_KEY_PREFIX: &str = "a:";

const TIME_DIGITS: usize = 20;

/// Resolve over entries ordered by `at` descending: the first entry at or
/// before `t`.
pub fn resolve_descending<I>(entries: I, t: Timestamp) -> Option<Ref>
where
    I: IntoIterator<Item = (Timestamp, Ref)>,
{
    entries
        .into_iter()
        .find(|(at, _)| *at <= t)
        .map(|(_, r)| r)
}

/// Resolve over entries ordered by `at` ascending: scan to the first entry
/// after `t` and take the one before it.
pub fn resolve_ascending<I>(entries: I, t: Timestamp) -> Option<Ref>
where
    I: IntoIterator<Item = (Timestamp, Ref)>,
{
    let mut found = None;
    for (at, r) in entries {
        if at > t {
            break;
        }
        found = Some(r);
    }
    found
}

/// Key prefix shared by every history entry of `name`.
pub fn anchor_key_prefix(name: &str) -> String {
    format!("{ANCHOR_KEY_PREFIX}{}:", hex::encode(name))
}

/// `a:<hex(name)>:<%020d(MAX_NANOS - nanos(at))>`.
pub fn encode_anchor_key(name: &str, at: Timestamp) -> Result<String, TypeError> {
    let nanos = to_nanos(&at)?;
    // Spans i64::MIN..=i64::MAX, which is exactly the u64 range.
    let inverted = (i128::from(MAX_NANOS) - i128::from(nanos)) as u64;
    Ok(format!(
        "{}{:0width$}",
        anchor_key_prefix(name),
        inverted,
        width = TIME_DIGITS
    ))
}

/// Inverse of [`encode_anchor_key`].
pub fn decode_anchor_key(key: &str) -> Result<(String, Timestamp), TypeError> {
    let invalid = |reason: &str| TypeError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let rest = key
        .strip_prefix(ANCHOR_KEY_PREFIX)
        .ok_or_else(|| invalid("missing anchor prefix"))?;
    let (name_hex, digits) = rest
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing time separator"))?;
    if digits.len() != TIME_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("time field is not 20 decimal digits"));
    }
    let inverted: u64 = digits.parse().map_err(|_| invalid("time field overflows"))?;
    let name_bytes = hex::decode(name_hex).map_err(|_| invalid("name is not hex"))?;
    let name = String::from_utf8(name_bytes).map_err(|_| invalid("name is not UTF-8"))?;
    let nanos = (i128::from(MAX_NANOS) - i128::from(inverted)) as i64;
    Ok((name, from_nanos(nanos)))
}

/// `b:<hex(ref)>`.
pub fn encode_blob_key(r: &Ref) -> String {
    format!("{BLOB_KEY_PREFIX}{}", r.to_hex())
}

/// Inverse of [`encode_blob_key`].
pub fn decode_blob_key(key: &str) -> Result<Ref, TypeError> {
    let hex = key
        .strip_prefix(BLOB_KEY_PREFIX)
        .ok_or_else(|| TypeError::InvalidKey {
            key: key.to_string(),
            reason: "missing blob prefix".to_string(),
        })?;
    Ref::from_hex(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabs_types::{max_time, parse_timestamp};
    use chrono::Duration;
    use proptest::prelude::*;

    fn history() -> (Timestamp, Timestamp, Vec<(Timestamp, Ref)>) {
        let t1 = parse_timestamp("1977-08-05T12:00:00-04:00").unwrap();
        let t2 = t1 + Duration::hours(1);
        let entries = vec![(t1, Ref::of(b"r1a")), (t2, Ref::of(b"r1b"))];
        (t1, t2, entries)
    }

    #[test]
    fn ascending_resolution() {
        let (t1, t2, asc) = history();
        let get = |t| resolve_ascending(asc.clone(), t);
        assert_eq!(get(t1), Some(Ref::of(b"r1a")));
        assert_eq!(get(t1 + Duration::minutes(1)), Some(Ref::of(b"r1a")));
        assert_eq!(get(t2 - Duration::minutes(1)), Some(Ref::of(b"r1a")));
        assert_eq!(get(t2), Some(Ref::of(b"r1b")));
        assert_eq!(get(t2 + Duration::days(400)), Some(Ref::of(b"r1b")));
        assert_eq!(get(t1 - Duration::minutes(1)), None);
    }

    #[test]
    fn descending_resolution_agrees() {
        let (t1, t2, asc) = history();
        let desc: Vec<_> = asc.iter().rev().copied().collect();
        for t in [
            t1 - Duration::minutes(1),
            t1,
            t1 + Duration::nanoseconds(1),
            t2 - Duration::nanoseconds(1),
            t2,
            t2 + Duration::minutes(1),
        ] {
            assert_eq!(
                resolve_descending(desc.clone(), t),
                resolve_ascending(asc.clone(), t)
            );
        }
    }

    #[test]
    fn anchor_key_layout() {
        let t = cabs_types::time::from_nanos(0);
        let key = encode_anchor_key("hi", t).unwrap();
        assert_eq!(key, format!("a:6869:{:020}", i64::MAX));

        let max = encode_anchor_key("hi", max_time()).unwrap();
        assert_eq!(max, format!("a:6869:{}", "0".repeat(20)));
    }

    #[test]
    fn anchor_key_prefix_matches() {
        let key = encode_anchor_key("a/b", max_time()).unwrap();
        assert!(key.starts_with(&anchor_key_prefix("a/b")));
        assert!(!key.starts_with(&anchor_key_prefix("a")));
    }

    #[test]
    fn malformed_anchor_keys() {
        for key in ["b:00", "a:6869", "a:6869:123", "a:zz:00000000000000000000"] {
            assert!(decode_anchor_key(key).is_err(), "{key}");
        }
    }

    #[test]
    fn blob_keys() {
        let r = Ref::of(b"blob");
        let key = encode_blob_key(&r);
        assert_eq!(key.len(), 66);
        assert_eq!(decode_blob_key(&key).unwrap(), r);
        assert!(decode_blob_key(&r.to_hex()).is_err());
    }

    proptest! {
        #[test]
        fn anchor_key_roundtrip(name in ".*", nanos in any::<i64>()) {
            let t = cabs_types::time::from_nanos(nanos);
            let key = encode_anchor_key(&name, t).unwrap();
            let (n, at) = decode_anchor_key(&key).unwrap();
            prop_assert_eq!(n, name);
            prop_assert_eq!(at, t);
        }

        #[test]
        fn later_instants_sort_first(
            name in "[a-z]{1,8}",
            a in any::<i64>(),
            b in any::<i64>(),
        ) {
            prop_assume!(a != b);
            let (lo, hi) = (a.min(b), a.max(b));
            let k_lo = encode_anchor_key(&name, cabs_types::time::from_nanos(lo)).unwrap();
            let k_hi = encode_anchor_key(&name, cabs_types::time::from_nanos(hi)).unwrap();
            prop_assert!(k_lo > k_hi);
        }
    }
}
