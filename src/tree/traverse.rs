//! Descent from the root and B-link move-right.
//!
//! Readers and writers share one descent: follow [`Node::route`] until a
//! node at the target level covers the key. Concurrent splits are absorbed
//! by moving right along sibling links; only a deleted node forces a
//! restart from the (re-read) root.
//!
//! Writers then lock the node they found and re-check coverage under the
//! lock, moving right (one lock at a time) if a split got there first.

use crate::key::Key;
use crate::node::{Node, NodeGuard, Route};
use crate::pmem::PmemPool;
use crate::tracing_helpers::trace_log;

use super::BTree;

impl<P: PmemPool + 'static> BTree<P> {
    /// The node at `level` whose range covers `key`, found without locking.
    ///
    /// `None` when the tree is currently shorter than `level`.
    pub(crate) fn find_node(&self, key: &Key, level: u32) -> Option<&Node> {
        'restart: loop {
            let mut node = self.root_node()?;
            if node.level() < level {
                if node.is_deleted() {
                    // stale root mid-collapse
                    continue 'restart;
                }
                return None;
            }

            loop {
                match node.route(key, level) {
                    Route::Here => return Some(node),

                    Route::Child(next) | Route::MoveRight(next) => {
                        let Some(next) = self.node(next) else {
                            continue 'restart;
                        };
                        node = next;
                    }

                    Route::Restart => {
                        trace_log!(node = %node.id(), "descent restart");
                        continue 'restart;
                    }
                }
            }
        }
    }

    /// Lock the node at `level` that covers `key`.
    ///
    /// On return the node is live and `key < high_key`, and that stays true
    /// while the guard is held.
    pub(crate) fn lock_covering(&self, key: &Key, level: u32) -> Option<NodeGuard<'_>> {
        'restart: loop {
            let mut guard = self.find_node(key, level)?.lock();

            loop {
                if guard.is_deleted() {
                    drop(guard);
                    continue 'restart;
                }

                if *key < guard.high_key() {
                    return Some(guard);
                }

                let Some(next) = guard.sibling().and_then(|id| self.node(id)) else {
                    drop(guard);
                    continue 'restart;
                };
                drop(guard);
                guard = next.lock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TreeConfig;
    use crate::key::Key;
    use crate::pmem::DramPool;
    use crate::tree::BTree;
    use crate::value::ValuePtr;

    fn small_tree() -> BTree {
        BTree::with_pool(DramPool::new(), TreeConfig::with_capacity(4)).unwrap()
    }

    #[test]
    fn test_find_node_on_single_leaf() {
        let tree = small_tree();
        let leaf = tree.find_node(&Key::from_u64(5), 0).unwrap();
        assert_eq!(leaf.id(), tree.root_id());
        assert!(tree.find_node(&Key::from_u64(5), 1).is_none());
    }

    #[test]
    fn test_lock_covering_after_splits() {
        let tree = small_tree();
        for i in 1..=40u64 {
            tree.insert(Key::from_u64(i), ValuePtr::new(i).unwrap()).unwrap();
        }
        assert!(tree.height() >= 1);

        for i in [1u64, 17, 40, 1000] {
            let key = Key::from_u64(i);
            let guard = tree.lock_covering(&key, 0).unwrap();
            assert!(guard.is_leaf());
            assert!(key < guard.high_key());
        }
    }
}
