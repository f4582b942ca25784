//! Filepath: src/tree.rs
//! `BTree` - a failure-atomic, concurrent B+-tree over a persistent pool.
//!
//! This module holds the tree handle and the operations shared by its
//! submodules. The algorithms live in:
//!
//! - [`traverse`]: root-to-node descent and move-right.
//! - [`insert`]: leaf insert, separator propagation, root growth.
//! - [`delete`]: leaf delete, merge/redistribution, root collapse.
//! - [`scan`]: range scans.
//! - [`recovery`]: rebuilding a tree from a pool's durable image.
//! - [`inspect`]: level dumps and structural checks.
//!
//! # Concurrency
//!
//! - Searches and scans never lock. They validate per-node versions and
//!   restart only when they hit a deleted node.
//! - Inserts hold at most one node lock at a time.
//! - Deletes that rebalance lock parent, left, right in that order. Root
//!   changes serialize on the tree's root mutex, taken before any node lock.
//!
//! Every operation runs inside a `seize` guard; node identities freed by
//! merges are recycled only after all guards that could see them are gone.

use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use seize::{Collector, LocalGuard};

use crate::arena::NodeArena;
use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::node::{Node, NodeCtx, NodeId};
use crate::ordering::{READ_ORD, ROOT_ORD, WRITE_ORD};
use crate::pmem::{DramPool, PmemPool};
use crate::tracing_helpers::debug_log;

mod delete;
mod insert;
mod inspect;
mod recovery;
mod scan;
mod traverse;


pub use inspect::{NodeSummary, TreeStats};

/// A concurrent, crash-consistent B+-tree of 16-byte keys to record
/// references.
///
/// # Example
///
/// ```rust
/// use fairtree::{BTree, Key, ValuePtr};
///
/// let tree = BTree::new();
/// let v = ValuePtr::new(7).unwrap();
/// tree.insert(Key::from_u64(1), v).unwrap();
///
/// assert_eq!(tree.search(&Key::from_u64(1)), Some(v));
/// assert!(tree.delete(&Key::from_u64(1)));
/// assert_eq!(tree.search(&Key::from_u64(1)), None);
/// ```
pub struct BTree<P: PmemPool + 'static = DramPool> {
    /// Guards node identities against reuse while readers may hold them.
    collector: Collector,

    /// Persistent-memory pool. Shared with deferred reclaimers.
    pool: Arc<P>,

    arena: NodeArena,

    config: TreeConfig,

    /// Current root id.
    root: AtomicU64,

    /// Level of the root (0 = the root is a leaf).
    height: AtomicU32,

    /// Serializes root growth and collapse.
    root_lock: Mutex<()>,

    /// Keys present, maintained by insert and delete.
    count: AtomicUsize,
}

impl<P: PmemPool + 'static> StdFmt::Debug for BTree<P> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root_id())
            .field("height", &self.height())
            .field("count", &self.len())
            .field("capacity", &self.config.capacity())
            .finish_non_exhaustive()
    }
}

impl BTree<DramPool> {
    /// Empty tree on a volatile pool with 512-byte pages.
    #[must_use]
    pub fn new() -> Self {
        match Self::with_pool(DramPool::new(), TreeConfig::default()) {
            Ok(tree) => tree,
            // unbounded pool and default config cannot fail
            Err(e) => unreachable!("{e}"),
        }
    }
}

impl Default for BTree<DramPool> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PmemPool + 'static> BTree<P> {
    /// Empty tree on `pool`: a single empty leaf as root.
    ///
    /// # Errors
    /// [`TreeError::Config`] for a rejected config,
    /// [`TreeError::AllocationFailure`] if the pool cannot hold the root.
    pub fn with_pool(pool: P, config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;

        let arena = NodeArena::new(config.capacity());
        let root = arena.allocate(&pool, 0)?;
        root.persist_page(&pool);
        let root_id = root.id();
        pool.swap_root(root_id);

        debug_log!(root = %root_id, capacity = config.capacity(), "tree created");

        Ok(Self::assemble(pool, arena, config, root_id, 0, 0))
    }

    fn assemble(
        pool: P,
        arena: NodeArena,
        config: TreeConfig,
        root: NodeId,
        height: u32,
        count: usize,
    ) -> Self {
        Self {
            collector: Collector::new(),
            pool: Arc::new(pool),
            arena,
            config,
            root: AtomicU64::new(root.get()),
            height: AtomicU32::new(height),
            root_lock: Mutex::new(()),
            count: AtomicUsize::new(count),
        }
    }

    /// Enter a protected region.
    ///
    /// Node ids observed while the guard lives are not recycled. The plain
    /// operations create their own guard; the `_with_guard` variants reuse
    /// one across calls.
    #[must_use]
    #[inline(always)]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Current root.
    #[must_use]
    #[inline]
    pub fn root_id(&self) -> NodeId {
        NodeId::new(self.root.load(READ_ORD)).unwrap_or(NodeId::FIRST)
    }

    /// Level of the root; 0 while the root is a leaf.
    #[must_use]
    #[inline]
    pub fn height(&self) -> u32 {
        self.height.load(READ_ORD)
    }

    /// Slots per node.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.config.capacity()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The pool.
    #[must_use]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Number of keys.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(AtomicOrdering::Relaxed)
    }

    /// True when the tree holds no key.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    //  Shared internals
    // ========================================================================

    #[inline]
    fn ctx(&self) -> NodeCtx<'_, P> {
        NodeCtx::new(&self.pool, &self.arena)
    }

    #[inline]
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    #[inline]
    fn root_node(&self) -> Option<&Node> {
        self.node(self.root_id())
    }

    /// Durably install `root` at `height`. Root mutex held.
    fn install_root(&self, root: NodeId, height: u32) {
        self.pool.swap_root(root);
        self.root.swap(root.get(), ROOT_ORD);
        self.height.store(height, WRITE_ORD);
    }

    /// Hand a deleted node's id back to the pool after a grace period.
    fn retire(&self, guard: &LocalGuard<'_>, id: NodeId) {
        self.arena.retire(guard, &self.pool, id);
    }
}
