//! Insertion, separator propagation and root growth.
//!
//! A leaf insert that splits leaves a separator for the next level up. The
//! leaf lock is released first; the separator is then inserted like any
//! other key, one level higher, which may split again.
//!
//! # Root growth
//!
//! When a separator targets a level above the root, [`BTree::ensure_level`]
//! builds a new root under the root mutex. The new root covers the old
//! root's whole sibling chain: `leftmost` is the old root and each further
//! node in the chain gets a slot keyed by its left neighbour's fence. It is
//! persisted before the root reference is swapped, so a crash leaves either
//! the old root (with the new nodes reachable by move-right) or the new one.
//!
//! # Late separators
//!
//! Between a split and the insert of its separator, other writers may have
//! settled the new node already: root growth links it, redistribution
//! rekeys its slot, or a merge folds it away and deletes it. The separator
//! is then dropped. Both checks run under the parent lock, which every one
//! of those writers holds while it changes the parent.

use seize::LocalGuard;

use crate::error::TreeError;
use crate::key::{KEY_INFINITY, Key};
use crate::node::{Node, NodeGuard, NodeId, StoreOutcome};
use crate::pmem::PmemPool;
use crate::slot::Entry;
use crate::tracing_helpers::{debug_log, trace_log};
use crate::value::ValuePtr;

use super::BTree;

impl<P: PmemPool + 'static> BTree<P> {
    /// Insert `key -> value`, overwriting any previous value.
    ///
    /// # Errors
    /// - [`TreeError::ReservedKey`] for [`KEY_INFINITY`].
    /// - [`TreeError::AllocationFailure`] when a split needs a node the pool
    ///   cannot provide. The tree stays consistent; the key may or may not
    ///   be present depending on which split failed.
    pub fn insert(&self, key: Key, value: ValuePtr) -> Result<(), TreeError> {
        let guard = self.guard();
        self.insert_with_guard(key, value, &guard)
    }

    /// [`insert`](Self::insert) inside an existing guard.
    ///
    /// # Errors
    /// As [`insert`](Self::insert).
    pub fn insert_with_guard(
        &self,
        key: Key,
        value: ValuePtr,
        _guard: &LocalGuard<'_>,
    ) -> Result<(), TreeError> {
        if key.is_infinity() {
            return Err(TreeError::ReservedKey);
        }

        let ctx = self.ctx();
        let outcome = loop {
            let Some(mut leaf) = self.lock_covering(&key, 0) else {
                continue;
            };
            let node = leaf.node();
            match node.store(&mut leaf, &ctx, key, value.get())? {
                StoreOutcome::MoveRight(_) | StoreOutcome::Deleted => continue,
                outcome => break outcome,
            }
        };

        match outcome {
            StoreOutcome::Inserted => {
                self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }

            StoreOutcome::Split { separator, right } => {
                self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.insert_internal(separator, right, 1)?;
            }

            _ => {}
        }

        trace_log!(?key, "insert");
        Ok(())
    }

    /// Insert separator `(separator, child)` at `level`, splitting upward as
    /// needed. Dropped if `child` is already linked or has been deleted.
    ///
    /// The caller holds a guard, so a deleted `child` keeps its id until this
    /// returns.
    pub(crate) fn insert_internal(
        &self,
        mut separator: Key,
        mut child: NodeId,
        mut level: u32,
    ) -> Result<(), TreeError> {
        let ctx = self.ctx();
        loop {
            if self.is_gone(child) {
                trace_log!(%child, level, "separator for deleted node dropped");
                return Ok(());
            }
            self.ensure_level(level)?;

            let Some(mut parent) = self.lock_covering(&separator, level) else {
                // root collapsed under us; grow again
                continue;
            };
            if self.is_gone(child) || Self::links(&parent, child) {
                trace_log!(%child, level, ?separator, "separator already settled");
                return Ok(());
            }
            let node = parent.node();
            match node.store(&mut parent, &ctx, separator, child.get())? {
                StoreOutcome::Split {
                    separator: up,
                    right,
                } => {
                    drop(parent);
                    separator = up;
                    child = right;
                    level += 1;
                }

                StoreOutcome::MoveRight(_) | StoreOutcome::Deleted => {}

                StoreOutcome::Inserted | StoreOutcome::Updated => return Ok(()),
            }
        }
    }

    fn is_gone(&self, child: NodeId) -> bool {
        self.node(child).is_none_or(Node::is_deleted)
    }

    /// Whether a locked parent already references `child`, under any key.
    fn links(parent: &NodeGuard<'_>, child: NodeId) -> bool {
        parent.leftmost() == Some(child)
            || parent
                .visible_unchecked()
                .iter()
                .any(|e| e.ptr == child.get())
    }

    /// Grow the tree until its root is at least at `level`.
    pub(crate) fn ensure_level(&self, level: u32) -> Result<(), TreeError> {
        if self.height() >= level {
            return Ok(());
        }

        let _root = self.root_lock.lock();
        let ctx = self.ctx();
        let capacity = self.capacity();

        while self.height() < level {
            let height = self.height();
            let old_root = self.root_id();

            // (fence of left neighbour, node) for the chain right of the root
            let mut entries: Vec<Entry> = Vec::new();
            let mut cursor = self.node(old_root);
            while let Some(node) = cursor {
                if entries.len() == capacity {
                    break;
                }
                let (high, sibling) = {
                    let g = node.lock();
                    (g.high_key(), g.sibling())
                };
                let Some(next) = sibling else { break };
                entries.push(Entry::new(high, next.get()));
                cursor = self.node(next);
            }

            let root = ctx.allocate(height + 1)?;
            root.fill(Some(old_root), &entries, KEY_INFINITY, None);
            root.persist_page(ctx.pool);
            self.install_root(root.id(), height + 1);

            debug_log!(
                root = %root.id(),
                level = height + 1,
                children = entries.len() + 1,
                "root grown"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TreeConfig;
    use crate::error::TreeError;
    use crate::key::{KEY_INFINITY, Key};
    use crate::node::{NodeId, StoreOutcome};
    use crate::pmem::{DramPool, PmemPool};
    use crate::tree::BTree;
    use crate::value::ValuePtr;

    fn v(n: u64) -> ValuePtr {
        ValuePtr::new(n).unwrap()
    }

    fn tree(capacity: usize) -> BTree {
        BTree::with_pool(DramPool::new(), TreeConfig::with_capacity(capacity)).unwrap()
    }

    #[test]
    fn test_reserved_key_rejected() {
        let t = tree(4);
        assert_eq!(t.insert(KEY_INFINITY, v(1)), Err(TreeError::ReservedKey));
        assert!(t.is_empty());
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let t = tree(4);
        t.insert(Key::from_u64(1), v(1)).unwrap();
        t.insert(Key::from_u64(1), v(2)).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.search(&Key::from_u64(1)), Some(v(2)));
    }

    #[test]
    fn test_first_split_grows_root() {
        let t = tree(4);
        for i in 1..=4u64 {
            t.insert(Key::from_u64(i), v(i)).unwrap();
        }
        assert_eq!(t.height(), 0);
        let allocations = t.pool().stats().allocations;

        t.insert(Key::from_u64(5), v(5)).unwrap();

        assert_eq!(t.height(), 1);
        // new leaf plus new root
        assert_eq!(t.pool().stats().allocations, allocations + 2);
        let levels = t.levels();
        assert_eq!(levels[0].len(), 1);
        assert_eq!(levels[1].len(), 2);
        assert_eq!(levels[0][0].keys, vec![Key::from_u64(3)]);
    }

    #[test]
    fn test_many_splits_keep_every_key() {
        let t = tree(3);
        for i in (1..=500u64).rev() {
            t.insert(Key::from_u64(i), v(i)).unwrap();
        }
        for i in 1..=500u64 {
            assert_eq!(t.search(&Key::from_u64(i)), Some(v(i)), "key {i}");
        }
        assert_eq!(t.len(), 500);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_allocation_failure_leaves_tree_usable() {
        let t = BTree::with_pool(DramPool::with_limit(3), TreeConfig::with_capacity(3)).unwrap();
        let mut failed = false;
        for i in 1..=50u64 {
            match t.insert(Key::from_u64(i), v(i)) {
                Ok(()) => {}
                Err(TreeError::AllocationFailure(_)) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(failed);
        t.check_invariants().unwrap();
        assert_eq!(t.search(&Key::from_u64(1)), Some(v(1)));
    }

    /// Split the root leaf directly, without propagating the separator.
    fn split_without_propagating(t: &BTree, key: u64) -> (Key, NodeId) {
        let ctx = t.ctx();
        let mut leaf = t.lock_covering(&Key::from_u64(key), 0).unwrap();
        let node = leaf.node();
        match node.store(&mut leaf, &ctx, Key::from_u64(key), key).unwrap() {
            StoreOutcome::Split { separator, right } => (separator, right),
            other => panic!("expected a split, got {other:?}"),
        }
    }

    #[test]
    fn test_late_separator_for_merged_node_is_dropped() {
        let t = tree(4);
        let guard = t.guard();
        for i in 1..=4u64 {
            t.insert(Key::from_u64(i), v(i)).unwrap();
        }
        let (separator, right) = split_without_propagating(&t, 5);
        t.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // another writer grows the root over the chain, then the new leaf
        // underflows and is merged away before the separator arrives
        t.ensure_level(1).unwrap();
        assert!(t.delete(&Key::from_u64(5)));
        assert!(t.delete(&Key::from_u64(4)));
        assert!(t.node(right).unwrap().is_deleted());
        assert_eq!(t.height(), 0);

        t.insert_internal(separator, right, 1).unwrap();

        assert_eq!(t.height(), 0);
        t.check_invariants().unwrap();
        for i in 1..=3u64 {
            assert_eq!(t.search(&Key::from_u64(i)), Some(v(i)));
        }
        t.insert(Key::from_u64(9), v(9)).unwrap();
        assert_eq!(t.search(&Key::from_u64(9)), Some(v(9)));
        drop(guard);
    }

    #[test]
    fn test_late_separator_after_redistribution_is_dropped() {
        let t = tree(4);
        let guard = t.guard();
        for i in [10u64, 20, 30, 40] {
            t.insert(Key::from_u64(i), v(i)).unwrap();
        }
        let (separator, right) = split_without_propagating(&t, 50);
        t.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(separator, Key::from_u64(30));
        t.ensure_level(1).unwrap();

        // left leaf [10,11,12,20] is full, so the underflowing right leaf
        // borrows 20 and its parent slot is rekeyed to 20
        t.insert(Key::from_u64(11), v(11)).unwrap();
        t.insert(Key::from_u64(12), v(12)).unwrap();
        assert!(t.delete(&Key::from_u64(50)));
        assert!(t.delete(&Key::from_u64(40)));
        assert_eq!(t.levels()[0][0].keys, vec![Key::from_u64(20)]);

        t.insert_internal(separator, right, 1).unwrap();

        assert_eq!(t.levels()[0][0].keys, vec![Key::from_u64(20)]);
        assert_eq!(t.levels()[0][0].children.len(), 2);
        t.check_invariants().unwrap();
        for i in [10u64, 11, 12, 20, 30] {
            assert_eq!(t.search(&Key::from_u64(i)), Some(v(i)));
        }
        drop(guard);
    }
}
