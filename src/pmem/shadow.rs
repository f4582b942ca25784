//! Crash-simulating pool.
//!
//! Every persist copies its bytes into a shadow image: the state the medium
//! would hold after a power loss. A crash budget can be armed with
//! [`ShadowPool::crash_after`]; once it runs out the pool silently drops
//! every later persist, exactly as if power failed at that boundary while
//! the in-memory tree kept running. [`ShadowPool::restart`] then builds a
//! fresh pool over the frozen image for `BTree::open` to recover from.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::PmemError;
use crate::node::NodeId;
use crate::tracing_helpers::debug_log;

use super::{IdAllocator, PersistStats, PmemPool, PoolImage, StatCounters};

const NO_CRASH: u64 = u64::MAX;

#[derive(Debug, Default)]
struct Durable {
    root: Option<NodeId>,
    pages: BTreeMap<NodeId, Vec<u8>>,
}

/// A pool that tracks its durable image and can fake a power failure.
#[derive(Debug)]
pub struct ShadowPool {
    ids: IdAllocator,
    stats: StatCounters,
    durable: Mutex<Durable>,

    /// Persists still allowed before the simulated crash.
    budget: AtomicU64,
    crashed: AtomicBool,
    dropped: AtomicU64,
}

impl ShadowPool {
    /// Empty pool, no crash armed.
    #[must_use]
    pub fn new() -> Self {
        Self::from_durable(Durable::default(), None)
    }

    /// Empty pool with a node limit.
    #[must_use]
    pub fn with_limit(limit: u64) -> Self {
        Self::from_durable(Durable::default(), Some(limit))
    }

    fn from_durable(durable: Durable, limit: Option<u64>) -> Self {
        let highest = durable
            .pages
            .keys()
            .map(|id| id.get())
            .chain(durable.root.map(NodeId::get))
            .max()
            .unwrap_or(0);

        Self {
            ids: IdAllocator::new(highest + 1, durable.pages.len() as u64, limit),
            stats: StatCounters::new(),
            durable: Mutex::new(durable),
            budget: AtomicU64::new(NO_CRASH),
            crashed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Let `n` more persists through, then lose power.
    pub fn crash_after(&self, n: u64) {
        self.budget.store(n, Ordering::Release);
    }

    /// Lose power now.
    pub fn crash(&self) {
        self.crashed.store(true, Ordering::Release);
    }

    /// True once the simulated crash happened.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Persists dropped after the crash.
    #[must_use]
    pub fn dropped_persists(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A new pool holding only what was durable. Volatile state is gone.
    #[must_use]
    pub fn restart(&self) -> Self {
        let durable = self.durable.lock();
        let copy = Durable {
            root: durable.root,
            pages: durable.pages.clone(),
        };
        drop(durable);

        debug_log!(pages = copy.pages.len(), "shadow pool restarted");
        Self::from_durable(copy, None)
    }

    /// Consume one unit of crash budget. False once power is gone.
    fn admit(&self) -> bool {
        if self.crashed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let admitted = self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
                NO_CRASH => Some(NO_CRASH),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();

        if !admitted {
            debug_log!("simulated power failure");
            self.crashed.store(true, Ordering::Release);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }
}

impl Default for ShadowPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PmemPool for ShadowPool {
    fn allocate(&self) -> Result<NodeId, PmemError> {
        let id = self.ids.allocate()?;
        self.stats.record_allocation();
        Ok(id)
    }

    fn release(&self, id: NodeId) {
        self.ids.release(id);
        self.stats.record_release();
    }

    fn persist(&self, id: NodeId, offset: usize, bytes: &[u8]) {
        self.stats.record_persist(offset, bytes.len());
        if !self.admit() {
            return;
        }

        let mut durable = self.durable.lock();
        let page = durable.pages.entry(id).or_default();
        if page.len() < offset + bytes.len() {
            page.resize(offset + bytes.len(), 0);
        }
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn swap_root(&self, root: NodeId) -> Option<NodeId> {
        self.stats.record_persist(0, 8);
        let mut durable = self.durable.lock();
        let previous = durable.root;
        if self.admit() {
            durable.root = Some(root);
        }
        previous
    }

    fn durable_image(&self) -> Option<PoolImage> {
        let durable = self.durable.lock();
        durable.root.map(|root| PoolImage {
            root,
            pages: durable.pages.clone(),
        })
    }

    fn stats(&self) -> PersistStats {
        self.stats.snapshot()
    }
}
