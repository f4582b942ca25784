//! Filepath: src/pmem.rs
//!
//! The persistent-memory collaborator.
//!
//! The tree never touches the medium directly. It consumes three primitives
//! from a [`PmemPool`]:
//!
//! - `allocate` / `release`: hand out and take back node identities,
//! - `persist(id, offset, bytes)`: flush a byte range of a node and order it
//!   before every later persist,
//! - `swap_root`: durably replace the root reference.
//!
//! Two pools are provided:
//!
//! - [`DramPool`]: volatile, counts persists and flushed cache lines.
//! - [`ShadowPool`]: keeps the byte image that would survive a power loss,
//!   can simulate a crash at any persist boundary and restart over it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::PmemError;
use crate::layout::cache_lines;
use crate::node::NodeId;
use crate::tracing_helpers::debug_log;

mod dram;
mod shadow;

pub use dram::DramPool;
pub use shadow::ShadowPool;

/// A pool of persistent node storage.
///
/// # Contract
///
/// - `allocate` never returns an id that is live (allocated and not yet
///   released).
/// - `persist` is durable and ordered when it returns: a crash after it
///   returns preserves those bytes and every byte persisted before them.
/// - Implementations serialize their own bookkeeping; every method takes
///   `&self` and may be called from many threads.
pub trait PmemPool: Send + Sync {
    /// Hand out a node identity.
    ///
    /// # Errors
    /// [`PmemError::Exhausted`] when no node is available.
    fn allocate(&self) -> Result<NodeId, PmemError>;

    /// Take back an identity. Called only once no reader can still hold it.
    fn release(&self, id: NodeId);

    /// Flush `bytes` at `offset` within node `id` and fence.
    fn persist(&self, id: NodeId, offset: usize, bytes: &[u8]);

    /// Durably replace the root reference, returning the previous one.
    fn swap_root(&self, root: NodeId) -> Option<NodeId>;

    /// The state a restart would observe, if the pool keeps one.
    fn durable_image(&self) -> Option<PoolImage> {
        None
    }

    /// Persist accounting.
    fn stats(&self) -> PersistStats;
}

/// Durable contents of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolImage {
    /// Persisted root reference.
    pub root: NodeId,

    /// Every persisted page by id.
    pub pages: BTreeMap<NodeId, Vec<u8>>,
}

/// Counters kept by every pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    /// `persist` and `swap_root` calls.
    pub persists: u64,
    /// Cache lines flushed by those calls.
    pub cache_lines: u64,
    /// Successful allocations.
    pub allocations: u64,
    /// Released identities.
    pub releases: u64,
}

// ============================================================================
//  Shared bookkeeping
// ============================================================================

/// Identity allocator shared by the pool implementations.
///
/// Ids start at 1 (0 encodes "none" on the medium). Released ids are reused
/// before fresh ones are minted.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: AtomicU64,
    live: AtomicU64,
    limit: Option<u64>,
    free: Mutex<Vec<NodeId>>,
}

impl IdAllocator {
    pub(crate) const fn new(first: u64, live: u64, limit: Option<u64>) -> Self {
        Self {
            next: AtomicU64::new(first),
            live: AtomicU64::new(live),
            limit,
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn allocate(&self) -> Result<NodeId, PmemError> {
        if let Some(limit) = self.limit {
            let reserved = self
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    (live < limit).then_some(live + 1)
                });
            if reserved.is_err() {
                debug_log!(limit, "pool exhausted");
                return Err(PmemError::Exhausted { limit });
            }
        } else {
            self.live.fetch_add(1, Ordering::AcqRel);
        }

        if let Some(id) = self.free.lock().pop() {
            return Ok(id);
        }

        let raw = self.next.fetch_add(1, Ordering::AcqRel);
        Ok(NodeId::new(raw).unwrap_or(NodeId::FIRST))
    }

    pub(crate) fn release(&self, id: NodeId) {
        self.free.lock().push(id);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn live(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }
}

/// Atomic persist counters.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    persists: AtomicU64,
    cache_lines: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl StatCounters {
    pub(crate) const fn new() -> Self {
        Self {
            persists: AtomicU64::new(0),
            cache_lines: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_persist(&self, offset: usize, len: usize) {
        self.persists.fetch_add(1, Ordering::Relaxed);
        self.cache_lines
            .fetch_add(cache_lines(offset, len) as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PersistStats {
        PersistStats {
            persists: self.persists.load(Ordering::Relaxed),
            cache_lines: self.cache_lines.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_reuse() {
        let ids = IdAllocator::new(1, 0, None);
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);

        ids.release(a);
        assert_eq!(ids.allocate().unwrap(), a);
        assert_eq!(ids.live(), 2);
    }

    #[test]
    fn test_limit() {
        let ids = IdAllocator::new(1, 0, Some(2));
        let a = ids.allocate().unwrap();
        ids.allocate().unwrap();
        assert_eq!(ids.allocate(), Err(PmemError::Exhausted { limit: 2 }));

        ids.release(a);
        assert!(ids.allocate().is_ok());
    }

    #[test]
    fn test_stat_counters() {
        let s = StatCounters::default();
        s.record_persist(60, 8);
        s.record_allocation();
        let snap = s.snapshot();
        assert_eq!(snap.persists, 1);
        assert_eq!(snap.cache_lines, 2);
        assert_eq!(snap.allocations, 1);
    }
}
