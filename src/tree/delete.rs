//! Deletion and rebalancing.
//!
//! Removing a key may leave its leaf below `min_fill`. The node is then
//! merged with a neighbour under the same parent when both fit in one node,
//! or, for leaves, topped up from its left neighbour. A merge removes one
//! separator from the parent, which may underflow in turn; the walk goes up
//! until a node is full enough or the root is reached. A root left with no
//! separator is replaced by its only child.
//!
//! Rebalancing is best effort: if the parent changed or the neighbour is
//! mid-split, the underflow is simply left in place.
//!
//! # Lock order
//! Parent, then left child, then right child. The root mutex is only taken
//! with no node lock held.
//!
//! # Merge protocol (right `R` into left `L`)
//! 1. Remove the parent slot for `R`; `R` stays reachable from `L`.
//! 2. Copy `R`'s entries into `L` (invisible above `L.high`).
//! 3. `L.high = R.high`: the copies become visible.
//! 4. `L.sibling = R.sibling`: `R` is unlinked.
//! 5. Mark `R` deleted and retire its id.
//!
//! # Redistribution (leaves; `R` underflowed, `L` has more)
//! 1. Copy `L`'s upper entries into `R`.
//! 2. Remove the parent slot `(sep, R)`, then add `(s', R)`. In between,
//!    `R` is reached from `L` by move-right.
//! 3. `L.high = s'`.
//! 4. Clear the moved entries from `L`.

use std::sync::atomic::Ordering as AtomicOrdering;

use seize::LocalGuard;

use crate::key::Key;
use crate::node::{Node, NodeGuard, NodeId, RemoveOutcome};
use crate::pmem::PmemPool;
use crate::slot::Entry;
use crate::tracing_helpers::{debug_log, trace_log};

use super::BTree;

impl<P: PmemPool + 'static> BTree<P> {
    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &Key) -> bool {
        let guard = self.guard();
        self.delete_with_guard(key, &guard)
    }

    /// [`delete`](Self::delete) inside an existing guard.
    pub fn delete_with_guard(&self, key: &Key, guard: &LocalGuard<'_>) -> bool {
        if key.is_infinity() {
            return false;
        }

        let (leaf, remaining) = loop {
            let Some(mut g) = self.lock_covering(key, 0) else {
                return false;
            };
            let node = g.node();
            match node.remove_key(&mut g, self.pool(), key) {
                RemoveOutcome::Removed { remaining } => break (node.id(), remaining),
                RemoveOutcome::NotFound => return false,
                RemoveOutcome::MoveRight(_) | RemoveOutcome::Deleted => {}
            }
        };

        self.count.fetch_sub(1, AtomicOrdering::Relaxed);
        trace_log!(?key, remaining, "delete");

        if remaining < self.config.min_fill() && leaf != self.root_id() {
            self.delete_internal(key, leaf, 0, guard);
        }
        true
    }

    /// Rebalance the underflowing node `child` at `level`, located by `key`.
    pub(crate) fn delete_internal(
        &self,
        key: &Key,
        mut child: NodeId,
        mut level: u32,
        guard: &LocalGuard<'_>,
    ) {
        loop {
            if child == self.root_id() {
                if level > 0 {
                    self.collapse_root(guard);
                }
                return;
            }

            let Some(parent) = self.find_node(key, level + 1) else {
                return;
            };
            let mut pg = parent.lock();
            if pg.is_deleted() || *key >= pg.high_key() {
                return;
            }

            let candidates = Self::neighbours(&pg, child);
            if let Some(right) = self.try_merge(&mut pg, &candidates) {
                self.retire(guard, right);

                let left_in_parent = pg.visible_unchecked().len();
                let parent_is_root = parent.id() == self.root_id();
                drop(pg);

                let underflow = if parent_is_root {
                    left_in_parent == 0
                } else {
                    left_in_parent < self.config.min_fill()
                };
                if !underflow {
                    return;
                }
                child = parent.id();
                level += 1;
                continue;
            }

            // no merge fits: a leaf may borrow from its left neighbour
            if let Some(pair) = candidates.first().filter(|p| p.right == child) {
                if let Some((mut lg, mut rg)) = self.lock_pair(pair) {
                    if lg.is_leaf() {
                        self.redistribute(&mut pg, &mut lg, &mut rg, pair.separator);
                    }
                }
            }
            return;
        }
    }

    /// Merge the first candidate pair whose payload fits, returning the
    /// id of the node folded away.
    fn try_merge(&self, parent: &mut NodeGuard<'_>, candidates: &[Neighbours]) -> Option<NodeId> {
        for pair in candidates {
            let Some((mut lg, mut rg)) = self.lock_pair(pair) else {
                continue;
            };
            let moved = Node::merge_payload(&rg, pair.separator).len();
            if moved <= lg.free_slots() {
                self.merge(parent, &mut lg, &mut rg, pair.separator);
                return Some(pair.right);
            }
        }
        None
    }

    /// Lock `pair.left` then `pair.right`, if they are still adjacent and
    /// separated by `pair.separator`.
    fn lock_pair(&self, pair: &Neighbours) -> Option<(NodeGuard<'_>, NodeGuard<'_>)> {
        let left = self.node(pair.left)?;
        let right = self.node(pair.right)?;
        let lg = left.lock();
        let rg = right.lock();

        let adjacent = !lg.is_deleted()
            && !rg.is_deleted()
            && lg.sibling() == Some(right.id())
            && lg.high_key() == pair.separator;
        adjacent.then_some((lg, rg))
    }

    /// Merge candidates around `child` in a locked parent: the pair with
    /// its left neighbour first, then the pair with its right neighbour.
    fn neighbours(parent: &NodeGuard<'_>, child: NodeId) -> Vec<Neighbours> {
        let mut children: Vec<(Option<Key>, NodeId)> =
            parent.leftmost().map(|id| (None, id)).into_iter().collect();
        let mut entries = parent.visible_unchecked();
        entries.sort_unstable_by_key(|e| e.key);
        children.extend(
            entries
                .iter()
                .filter_map(|e| NodeId::new(e.ptr).map(|id| (Some(e.key), id))),
        );

        let Some(pos) = children.iter().position(|&(_, id)| id == child) else {
            return Vec::new();
        };
        [pos.checked_sub(1), Some(pos)]
            .into_iter()
            .flatten()
            .filter_map(|l| {
                let (_, left) = *children.get(l)?;
                let (separator, right) = *children.get(l + 1)?;
                Some(Neighbours {
                    left,
                    right,
                    separator: separator?,
                })
            })
            .collect()
    }

    /// Fold `right` into `left` and drop its parent slot.
    fn merge(
        &self,
        parent: &mut NodeGuard<'_>,
        left: &mut NodeGuard<'_>,
        right: &mut NodeGuard<'_>,
        separator: Key,
    ) {
        let pool = self.pool();
        let (p, l, r) = (parent.node(), left.node(), right.node());

        let removed = p.remove_child(parent, pool, r.id());
        debug_assert_eq!(removed, Some(separator), "parent slot mismatch");

        l.absorb(left, right, pool, separator);
        r.mark_deleted(right, pool);

        debug_log!(
            left = %l.id(),
            right = %r.id(),
            level = l.level(),
            ?separator,
            "merged"
        );
    }

    /// Move the upper part of `left` into the underflowing `right`.
    fn redistribute(
        &self,
        parent: &mut NodeGuard<'_>,
        left: &mut NodeGuard<'_>,
        right: &mut NodeGuard<'_>,
        separator: Key,
    ) {
        let pool = self.pool();
        let (p, l, r) = (parent.node(), left.node(), right.node());

        let mut from_left = l.visible_unchecked();
        from_left.sort_unstable_by_key(|e| e.key);
        let nl = from_left.len();
        let nr = r.visible_unchecked().len();
        if nl <= nr + 1 {
            return;
        }

        let take = (nl - nr) / 2;
        let moved = &from_left[nl - take..];
        let Some(first) = moved.first() else {
            return;
        };
        let new_separator = first.key;
        if r.free_slots() < take {
            return;
        }

        for &entry in moved {
            let placed = r.put_entry(right, pool, entry);
            debug_assert!(placed, "checked free slots");
        }

        let removed = p.remove_exact(parent, pool, Entry::new(separator, r.id().get()));
        debug_assert!(removed, "parent slot mismatch");
        let placed = p.put_entry(parent, pool, Entry::new(new_separator, r.id().get()));
        debug_assert!(placed, "slot freed just above");

        l.set_high_key(left, pool, new_separator);
        for i in 0..l.scan_len() {
            let e = l.slot(i).load();
            if e.is_occupied() && e.key >= new_separator {
                l.clear_slot(left, pool, i);
            }
        }
        l.shrink_last_index(left, pool);

        debug_log!(
            left = %l.id(),
            right = %r.id(),
            moved = take,
            ?new_separator,
            "redistributed"
        );
    }

    /// Replace a root that has no separator with its only child, repeatedly.
    pub(crate) fn collapse_root(&self, guard: &LocalGuard<'_>) {
        let _root = self.root_lock.lock();

        loop {
            let Some(root) = self.root_node() else {
                return;
            };
            if root.level() == 0 {
                return;
            }

            let mut g = root.lock();
            if g.sibling().is_some() || !g.visible_unchecked().is_empty() {
                return;
            }
            let Some(child) = g.leftmost() else {
                return;
            };

            self.install_root(child, root.level() - 1);
            root.mark_deleted(&mut g, self.pool());
            drop(g);
            self.retire(guard, root.id());

            debug_log!(old = %root.id(), new = %child, "root collapsed");
        }
    }
}

/// Two adjacent children of one parent and the separator between them.
#[derive(Debug, Clone, Copy)]
struct Neighbours {
    left: NodeId,
    right: NodeId,
    separator: Key,
}

#[cfg(test)]
mod tests {
    use crate::config::TreeConfig;
    use crate::key::Key;
    use crate::pmem::{DramPool, PmemPool};
    use crate::tree::BTree;
    use crate::value::ValuePtr;

    fn v(n: u64) -> ValuePtr {
        ValuePtr::new(n).unwrap()
    }

    fn k(n: u64) -> Key {
        Key::from_u64(n)
    }

    fn tree_with(capacity: usize, keys: impl IntoIterator<Item = u64>) -> BTree {
        let t = BTree::with_pool(DramPool::new(), TreeConfig::with_capacity(capacity)).unwrap();
        for i in keys {
            t.insert(k(i), v(i)).unwrap();
        }
        t
    }

    #[test]
    fn test_delete_present_and_missing() {
        let t = tree_with(4, 1..=3);
        assert!(t.delete(&k(2)));
        assert!(!t.delete(&k(2)));
        assert!(!t.delete(&k(99)));
        assert_eq!(t.search(&k(2)), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_merge_removes_parent_separator() {
        // capacity 4: [1,2] [3,4,5] under one root
        let t = tree_with(4, 1..=5);
        assert_eq!(t.levels()[0][0].keys.len(), 1);

        // right leaf drops to 1 < min_fill 2, both fit in one leaf
        assert!(t.delete(&k(5)));
        assert!(t.delete(&k(4)));

        let levels = t.levels();
        assert_eq!(levels.len(), 1, "root collapsed to the merged leaf");
        assert_eq!(levels[0][0].keys, vec![k(1), k(2), k(3)]);
        assert_eq!(t.height(), 0);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_removes_exactly_one_separator() {
        // capacity 4: [1,2] [3,4] [5,6,7,8] under root [3,5]
        let t = tree_with(4, 1..=8);
        let before = t.levels();
        assert_eq!(before[0][0].keys, vec![k(3), k(5)]);
        assert_eq!(before[1].len(), 3);
        let root = t.root_id();

        // [3] underflows and folds into [1,2]; the root keeps one separator
        assert!(t.delete(&k(4)));

        let after = t.levels();
        assert_eq!(t.root_id(), root);
        assert_eq!(after[0][0].keys.len(), before[0][0].keys.len() - 1);
        assert_eq!(after[0][0].keys, vec![k(5)]);
        assert_eq!(after[1].len(), 2);
        assert_eq!(after[1][0].keys, vec![k(1), k(2), k(3)]);
        for i in [1, 2, 3, 5, 6, 7, 8] {
            assert_eq!(t.search(&k(i)), Some(v(i)));
        }
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_drain_last_leaf_shrinks_parent_level() {
        let t = tree_with(4, 1..=12);
        let before = t.levels();
        let parent_slots: usize = before[before.len() - 2].iter().map(|n| n.keys.len()).sum();

        for i in (9..=12).rev() {
            assert!(t.delete(&k(i)));
        }

        let after = t.levels();
        let now: usize = after[after.len() - 2].iter().map(|n| n.keys.len()).sum();
        assert!(now < parent_slots, "{now} !< {parent_slots}");
        for i in 1..=8 {
            assert_eq!(t.search(&k(i)), Some(v(i)));
        }
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_redistribute_from_full_left() {
        let t = tree_with(4, [10, 20, 30, 40, 50, 11, 12]);
        // leaves: [10,11,12,20] [30,40,50]
        assert!(t.delete(&k(50)));
        assert!(t.delete(&k(40)));
        // right underflowed with a full left neighbour: entries move right
        let leaves = t.levels().pop().unwrap();
        assert_eq!(leaves.len(), 2);
        assert!(leaves[1].keys.len() >= 2, "{:?}", leaves[1].keys);
        for i in [10, 11, 12, 20, 30] {
            assert_eq!(t.search(&k(i)), Some(v(i)));
        }
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_delete_everything_then_reuse() {
        let t = tree_with(3, 1..=300);
        for i in 1..=300 {
            assert!(t.delete(&k(i)), "key {i}");
        }
        assert!(t.is_empty());
        assert_eq!(t.scan_entries(&k(0), &k(1000)).len(), 0);
        t.check_invariants().unwrap();

        for i in 1..=50 {
            t.insert(k(i), v(i)).unwrap();
        }
        assert_eq!(t.scan_entries(&k(0), &k(1000)).len(), 50);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_deleted_ids_are_recycled() {
        let t = tree_with(3, 1..=100);
        for i in 1..=100 {
            t.delete(&k(i));
        }
        for i in 1..=100 {
            t.insert(k(i), v(i)).unwrap();
        }
        let stats = t.pool().stats();
        assert!(stats.releases <= stats.allocations);
        assert_eq!(t.len(), 100);
        t.check_invariants().unwrap();
    }
}
