use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::refs::Ref;
use crate::time::Timestamp;

/// A single entry in an anchor's history.
///
/// States that at instant `at`, the logical name `name` designated the
/// content whose hash is `target`. For any name, at most one entry exists
/// per instant.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    /// The mutable name (e.g. `"hello.txt"`).
    pub name: String,
    /// The instant from which this entry is in effect.
    pub at: Timestamp,
    /// The ref the name designates from `at` onward.
    pub target: Ref,
}

impl Anchor {
    pub fn new(name: impl Into<String>, at: Timestamp, target: Ref) -> Self {
        Self {
            name: name.into(),
            at,
            target,
        }
    }
}

/// Anchors order by name, then by time ascending.
impl Ord for Anchor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then(self.at.cmp(&other.at))
            .then(self.target.cmp(&other.target))
    }
}

impl PartialOrd for Anchor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Anchor({} @ {} -> {})",
            self.name,
            self.at.to_rfc3339(),
            self.target.short_hex()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_timestamp;

    #[test]
    fn orders_by_name_then_time() {
        let t1 = parse_timestamp("2020-01-01T00:00:00Z").unwrap();
        let t2 = parse_timestamp("2021-01-01T00:00:00Z").unwrap();
        let r = Ref::of(b"x");

        let mut anchors = vec![
            Anchor::new("b", t1, r),
            Anchor::new("a", t2, r),
            Anchor::new("a", t1, r),
        ];
        anchors.sort();

        assert_eq!(anchors[0], Anchor::new("a", t1, r));
        assert_eq!(anchors[1], Anchor::new("a", t2, r));
        assert_eq!(anchors[2], Anchor::new("b", t1, r));
    }
}
