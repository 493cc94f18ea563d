use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Keys inserted
    pub inserts: u64,
    /// Keys removed
    pub deletes: u64,
    /// Full nodes split in two
    pub splits: u64,
    /// Sibling pairs merged into one node
    pub merges: u64,
    /// Keys borrowed from a sibling instead of merging
    pub rotations: u64,
    /// Range traversals started
    pub traversals: u64,
}

/// Thread-safe counters for B-tree structure changes.
#[derive(Default, Debug)]
pub struct BTreeStats {
    inserts: AtomicU64,
    deletes: AtomicU64,
    splits: AtomicU64,
    merges: AtomicU64,
    rotations: AtomicU64,
    traversals: AtomicU64,
}

impl BTreeStats {
    pub(crate) fn inc_inserts(&self) {
        self.inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_deletes(&self) {
        self.deletes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_rotations(&self) {
        self.rotations.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_traversals(&self) {
        self.traversals.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            inserts: self.inserts.load(AtomicOrdering::Relaxed),
            deletes: self.deletes.load(AtomicOrdering::Relaxed),
            splits: self.splits.load(AtomicOrdering::Relaxed),
            merges: self.merges.load(AtomicOrdering::Relaxed),
            rotations: self.rotations.load(AtomicOrdering::Relaxed),
            traversals: self.traversals.load(AtomicOrdering::Relaxed),
        }
    }
}
