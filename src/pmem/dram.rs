//! Volatile pool.
//!
//! Keeps no durable image; `persist` only updates the flush counters. This
//! is the pool used when durability is provided elsewhere or not needed,
//! and the one benchmarks run on.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PmemError;
use crate::node::NodeId;

use super::{IdAllocator, PersistStats, PmemPool, StatCounters};

/// An in-DRAM pool with optional node limit.
#[derive(Debug)]
pub struct DramPool {
    ids: IdAllocator,
    root: AtomicU64,
    stats: StatCounters,
}

impl DramPool {
    /// Unlimited pool.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ids: IdAllocator::new(1, 0, None),
            root: AtomicU64::new(0),
            stats: StatCounters::new(),
        }
    }

    /// Pool that refuses to hold more than `limit` live nodes.
    #[must_use]
    pub const fn with_limit(limit: u64) -> Self {
        Self {
            ids: IdAllocator::new(1, 0, Some(limit)),
            root: AtomicU64::new(0),
            stats: StatCounters::new(),
        }
    }

    /// Nodes currently allocated.
    #[must_use]
    pub fn live_nodes(&self) -> u64 {
        self.ids.live()
    }
}

impl Default for DramPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PmemPool for DramPool {
    fn allocate(&self) -> Result<NodeId, PmemError> {
        let id = self.ids.allocate()?;
        self.stats.record_allocation();
        Ok(id)
    }

    fn release(&self, id: NodeId) {
        self.ids.release(id);
        self.stats.record_release();
    }

    fn persist(&self, _id: NodeId, offset: usize, bytes: &[u8]) {
        self.stats.record_persist(offset, bytes.len());
    }

    fn swap_root(&self, root: NodeId) -> Option<NodeId> {
        self.stats.record_persist(0, 8);
        NodeId::new(self.root.swap(root.get(), Ordering::AcqRel))
    }

    fn stats(&self) -> PersistStats {
        self.stats.snapshot()
    }
}
