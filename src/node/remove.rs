//! Removal from a locked node, and the node half of a merge.
//!
//! Removal clears the pointer first and persists it (the entry is gone from
//! that instant), then resets the key. `last_index` is pulled down when the
//! tail empties.

use crate::key::Key;
use crate::pmem::PmemPool;
use crate::slot::Entry;

use super::{Node, NodeGuard, NodeId};

/// Result of [`Node::remove_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The key was removed; `remaining` visible entries are left.
    Removed {
        /// Visible entries after the removal.
        remaining: usize,
    },
    /// The key is not present.
    NotFound,
    /// The key is at or above the fence; retry at the sibling.
    MoveRight(NodeId),
    /// The node was deleted; retry from the root.
    Deleted,
}

impl Node {
    /// Remove `key` from this node.
    pub fn remove_key<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        pool: &P,
        key: &Key,
    ) -> RemoveOutcome {
        self.assert_owned(guard);

        if self.is_deleted() {
            return RemoveOutcome::Deleted;
        }

        if *key >= self.high_key() {
            return self
                .sibling()
                .map_or(RemoveOutcome::NotFound, RemoveOutcome::MoveRight);
        }

        let Some(i) = self.find_visible(key) else {
            return RemoveOutcome::NotFound;
        };

        self.clear_slot(guard, pool, i);
        self.shrink_last_index(guard, pool);

        RemoveOutcome::Removed {
            remaining: self.visible_unchecked().len(),
        }
    }

    /// Remove the separator pointing at `child`, returning its key.
    pub(crate) fn remove_child<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        pool: &P,
        child: NodeId,
    ) -> Option<Key> {
        self.assert_owned(guard);

        let high = self.high_key();
        let i = (0..self.scan_len()).find(|&i| {
            let e = self.slot(i).load();
            e.ptr == child.get() && e.key < high
        })?;
        let key = self.slot(i).key();

        self.clear_slot(guard, pool, i);
        self.shrink_last_index(guard, pool);
        Some(key)
    }

    /// Remove the entry `(key, ptr)` if present.
    pub(crate) fn remove_exact<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        pool: &P,
        entry: Entry,
    ) -> bool {
        self.assert_owned(guard);

        let Some(i) = (0..self.scan_len()).find(|&i| self.slot(i).load() == entry) else {
            return false;
        };
        self.clear_slot(guard, pool, i);
        self.shrink_last_index(guard, pool);
        true
    }

    /// Entries `right` would hand over if merged into this node: for
    /// internal nodes the separator paired with `right.leftmost`, then every
    /// visible entry of `right`.
    pub(crate) fn merge_payload(right: &Node, separator: Key) -> Vec<Entry> {
        let mut moved = Vec::with_capacity(right.capacity() + 1);
        if !right.is_leaf() {
            if let Some(leftmost) = right.leftmost() {
                moved.push(Entry::new(separator, leftmost.get()));
            }
        }
        moved.extend(right.visible_unchecked());
        moved
    }

    /// Take over the whole of `right` (its right neighbour, locked by the
    /// caller). Afterwards this node covers `right`'s range and `right` is
    /// unlinked; the caller marks it deleted and drops the parent slot.
    ///
    /// Order: entries, then the fence, then the sibling link. Until the fence
    /// moves the copied entries are invisible here and still live in `right`.
    pub(crate) fn absorb<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        right: &NodeGuard<'_>,
        pool: &P,
        separator: Key,
    ) {
        self.assert_owned(guard);
        debug_assert_eq!(self.sibling(), Some(right.id()), "absorbing a non-neighbour");

        let moved = Self::merge_payload(right, separator);
        debug_assert!(moved.len() <= self.free_slots(), "merge overflows node");
        for entry in moved {
            let placed = self.put_entry(guard, pool, entry);
            debug_assert!(placed, "merge overflows node");
        }

        self.set_high_key(guard, pool, right.high_key());
        self.set_sibling(guard, pool, right.sibling());
    }
}
