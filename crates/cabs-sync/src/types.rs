use serde::{Deserialize, Serialize};

/// What one store received during a synchronization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReport {
    pub refs_copied: usize,
    pub anchors_copied: usize,
}

/// Outcome of a synchronization, one [`StoreReport`] per store in the order
/// the stores were given.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Distinct refs seen across all stores.
    pub refs: usize,
    /// Distinct `(name, at)` anchor entries seen across all stores.
    pub anchors: usize,
    pub stores: Vec<StoreReport>,
}

impl SyncReport {
    pub fn new(stores: usize) -> Self {
        Self {
            stores: vec![StoreReport::default(); stores],
            ..Self::default()
        }
    }

    pub fn refs_copied(&self) -> usize {
        self.stores.iter().map(|s| s.refs_copied).sum()
    }

    pub fn anchors_copied(&self) -> usize {
        self.stores.iter().map(|s| s.anchors_copied).sum()
    }

    /// Fold `other`, a report over the same stores, into this one.
    pub fn absorb(&mut self, other: SyncReport) {
        self.refs += other.refs;
        self.anchors += other.anchors;
        for (mine, theirs) in self.stores.iter_mut().zip(other.stores) {
            mine.refs_copied += theirs.refs_copied;
            mine.anchors_copied += theirs.anchors_copied;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_adds_per_store() {
        let mut a = SyncReport::new(2);
        a.refs = 3;
        a.stores[0].refs_copied = 1;
        let mut b = SyncReport::new(2);
        b.anchors = 2;
        b.stores[1].anchors_copied = 2;
        a.absorb(b);
        assert_eq!(a.refs, 3);
        assert_eq!(a.anchors, 2);
        assert_eq!(a.refs_copied(), 1);
        assert_eq!(a.anchors_copied(), 2);
    }
}
