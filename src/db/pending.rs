use std::collections::hash_map::Entry;
use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::types::Address;

/// Why a record was queued for deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionKind {
    /// An owning relationship let go of the record; deleted unconditionally.
    Owned,
    /// The record looked unreferenced; re-checked before it is deleted.
    Unreferenced,
}

/// Addresses awaiting deletion, in scheduling order, each queued once.
#[derive(Default, Debug)]
pub(crate) struct PendingDeletions {
    order: VecDeque<Address>,
    kinds: FxHashMap<Address, DeletionKind>,
}

impl PendingDeletions {
    /// Queues `address`. Scheduling it again only upgrades the kind to `Owned`.
    pub(crate) fn schedule(&mut self, address: Address, kind: DeletionKind) {
        match self.kinds.entry(address) {
            Entry::Occupied(mut slot) => {
                if kind == DeletionKind::Owned {
                    slot.insert(DeletionKind::Owned);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(kind);
                self.order.push_back(address);
            }
        }
    }

    pub(crate) fn pop(&mut self) -> Option<(Address, DeletionKind)> {
        while let Some(address) = self.order.pop_front() {
            if let Some(kind) = self.kinds.remove(&address) {
                return Some((address, kind));
            }
        }
        None
    }

    /// Forgets `address`; used when it is deleted directly.
    pub(crate) fn remove(&mut self, address: Address) {
        self.kinds.remove(&address);
    }

    pub(crate) fn len(&self) -> usize {
        self.kinds.len()
    }
}
