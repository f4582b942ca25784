//! Optimistic, lock-free lookups within one node.
//!
//! Every function here follows the same loop: take a stable version, check
//! the deleted flag and the high fence, scan the slots, then validate. A
//! changed version discards the work and retries on the same node.
//!
//! Scan direction alternates with the node's write count: even counts scan
//! forward, odd counts scan backward. It does not affect results, only
//! which duplicate a torn scan would see first before validation.

use crate::key::Key;
use crate::nodeversion::NodeVersion;
use crate::value::ValuePtr;

use super::{Node, NodeId};

/// Result of a point lookup in a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafSearch {
    /// The key is present.
    Found(ValuePtr),
    /// The key is absent from the whole tree.
    NotFound,
    /// The key is at or above this node's fence; continue at the sibling.
    MoveRight(NodeId),
    /// The node was deleted; restart from the root.
    Restart,
}

/// Where to go next while descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The child covering the key.
    Child(NodeId),
    /// The key is at or above this node's fence.
    MoveRight(NodeId),
    /// This node covers the key (used at the target level).
    Here,
    /// The node was deleted or is inconsistent; restart from the root.
    Restart,
}

/// Outcome of scanning one leaf for a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStep {
    /// The range continues in `next`; every key below `resume` is collected.
    Continue {
        /// Right sibling.
        next: NodeId,
        /// This node's fence, the lowest key `next` covers.
        resume: Key,
    },
    /// The range ends in this node.
    Done,
    /// The node was deleted; restart from the root at the same lower bound.
    Restart,
}

#[inline(always)]
const fn forward(stable: u64) -> bool {
    NodeVersion::write_cycles(stable) % 2 == 0
}

impl Node {
    /// Point lookup in a leaf.
    #[must_use]
    pub fn linear_search(&self, key: &Key) -> LeafSearch {
        loop {
            let v = self.version.stable();

            if self.is_deleted() {
                if self.version.has_changed(v) {
                    continue;
                }
                return LeafSearch::Restart;
            }

            if *key >= self.high_key() {
                let sibling = self.sibling();
                if self.version.has_changed(v) {
                    continue;
                }
                return sibling.map_or(LeafSearch::NotFound, LeafSearch::MoveRight);
            }

            let len = self.scan_len();
            let hit = |i: usize| {
                let e = self.slot(i).load();
                (e.is_occupied() && e.key == *key).then_some(e.ptr)
            };
            let found = if forward(v) {
                (0..len).find_map(hit)
            } else {
                (0..len).rev().find_map(hit)
            };

            if self.version.has_changed(v) {
                continue;
            }

            return found
                .and_then(ValuePtr::new)
                .map_or(LeafSearch::NotFound, LeafSearch::Found);
        }
    }

    /// Routing step for a descent toward `level`.
    ///
    /// Returns [`Route::Here`] when this node is at `level` and covers `key`,
    /// otherwise the child (greatest separator `<= key`, or `leftmost`) or
    /// the sibling to move to.
    #[must_use]
    pub fn route(&self, key: &Key, level: u32) -> Route {
        loop {
            let v = self.version.stable();

            if self.is_deleted() {
                if self.version.has_changed(v) {
                    continue;
                }
                return Route::Restart;
            }

            let high = self.high_key();
            if *key >= high {
                let sibling = self.sibling();
                if self.version.has_changed(v) {
                    continue;
                }
                return sibling.map_or(Route::Restart, Route::MoveRight);
            }

            if self.level() <= level {
                if self.version.has_changed(v) {
                    continue;
                }
                return Route::Here;
            }

            let mut best: Option<(Key, u64)> = None;
            for i in 0..self.scan_len() {
                let e = self.slot(i).load();
                if e.is_occupied()
                    && e.key < high
                    && e.key <= *key
                    && best.is_none_or(|(k, _)| e.key > k)
                {
                    best = Some((e.key, e.ptr));
                }
            }
            let child = best.map_or_else(|| self.leftmost(), |(_, ptr)| NodeId::new(ptr));

            if self.version.has_changed(v) {
                continue;
            }

            return child.map_or(Route::Restart, Route::Child);
        }
    }

    /// Collect every visible entry with `min <= key <= max` into `out`, in
    /// key order.
    ///
    /// Nothing is appended unless the node validated, so a restart never
    /// duplicates output.
    pub fn linear_search_range(
        &self,
        min: &Key,
        max: &Key,
        out: &mut Vec<(Key, ValuePtr)>,
    ) -> RangeStep {
        let mut local: Vec<(Key, ValuePtr)> = Vec::with_capacity(self.capacity());
        loop {
            local.clear();
            let v = self.version.stable();

            if self.is_deleted() {
                if self.version.has_changed(v) {
                    continue;
                }
                return RangeStep::Restart;
            }

            let high = self.high_key();
            let sibling = self.sibling();
            for i in 0..self.scan_len() {
                let e = self.slot(i).load();
                if e.key >= *min && e.key <= *max && e.key < high {
                    if let Some(ptr) = ValuePtr::new(e.ptr) {
                        local.push((e.key, ptr));
                    }
                }
            }

            if self.version.has_changed(v) {
                continue;
            }

            local.sort_unstable_by_key(|(k, _)| *k);
            out.extend_from_slice(&local);

            return match sibling {
                Some(next) if high <= *max => RangeStep::Continue { next, resume: high },
                _ => RangeStep::Done,
            };
        }
    }
}
