//! Filepath: src/arena.rs
//!
//! Node storage indexed by [`NodeId`].
//!
//! Nodes live in geometrically growing segments that are created on first
//! use and never move or shrink, so `get` is a couple of loads and the
//! returned reference is valid for as long as the arena is.
//!
//! A node's memory is never freed while the tree lives. What is recycled is
//! its *identity*: a deleted node is retired through the tree's `seize`
//! collector, and its id goes back to the pool only once every guard that
//! could still be reading it has been dropped. Reuse then resets the node in
//! place.

use std::sync::{Arc, OnceLock};

use seize::{Collector, Guard, LocalGuard};

use crate::error::PmemError;
use crate::pmem::PmemPool;
use crate::tracing_helpers::trace_log;

use crate::node::{Node, NodeId};

/// Nodes in the first segment. Segment `s` holds `BASE << s` nodes.
const SEGMENT_BASE: usize = 64;

/// Segment count; addresses ids up to `SEGMENT_BASE * (2^SEGMENTS - 1)`.
const SEGMENTS: usize = 40;

/// Id-addressed node storage.
pub struct NodeArena {
    capacity: usize,
    segments: Box<[OnceLock<Box<[Node]>>]>,
}

impl std::fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.segments.iter().filter(|s| s.get().is_some()).count();
        f.debug_struct("NodeArena")
            .field("capacity", &self.capacity)
            .field("segments", &live)
            .finish()
    }
}

/// Position of `id` as `(segment, offset)`.
#[inline(always)]
const fn locate(id: NodeId) -> (usize, usize) {
    #[expect(clippy::cast_possible_truncation, reason = "ids fit in usize on 64-bit targets")]
    let index = (id.get() - 1) as usize;
    let bucket = index / SEGMENT_BASE + 1;
    let segment = (usize::BITS - 1 - bucket.leading_zeros()) as usize;
    let start = SEGMENT_BASE * ((1 << segment) - 1);
    (segment, index - start)
}

/// Identity waiting out a grace period.
struct Retired<P> {
    pool: Arc<P>,
    id: NodeId,
}

impl NodeArena {
    /// Empty arena for nodes of `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            segments: (0..SEGMENTS).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Slots per node.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The node for `id`, if its segment exists.
    #[must_use]
    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        let (segment, offset) = locate(id);
        self.segments.get(segment)?.get()?.get(offset)
    }

    /// The node for `id`, creating its segment if needed. `None` if the id
    /// is beyond the addressable range.
    pub(crate) fn slot(&self, id: NodeId) -> Option<&Node> {
        let (segment, offset) = locate(id);
        let cell = self.segments.get(segment)?;
        let nodes = cell.get_or_init(|| {
            let first = SEGMENT_BASE * ((1 << segment) - 1) + 1;
            let len = SEGMENT_BASE << segment;
            trace_log!(segment, len, "arena segment created");
            (first..first + len)
                .filter_map(|raw| NodeId::new(raw as u64))
                .map(|nid| Node::new(nid, self.capacity))
                .collect()
        });
        nodes.get(offset)
    }

    /// Allocate an id from `pool` and reset its node as an empty node at
    /// `level`.
    ///
    /// # Errors
    /// Pool exhaustion, or an id past the arena's addressable range.
    pub fn allocate<P: PmemPool>(&self, pool: &P, level: u32) -> Result<&Node, PmemError> {
        let id = pool.allocate()?;
        let Some(node) = self.slot(id) else {
            pool.release(id);
            return Err(PmemError::Exhausted {
                limit: (SEGMENT_BASE * ((1 << SEGMENTS) - 1)) as u64,
            });
        };
        node.reset(level);
        Ok(node)
    }

    /// Return `id` to `pool` once no guard of `collector` can observe it.
    pub fn retire<P: PmemPool + 'static>(&self, guard: &LocalGuard<'_>, pool: &Arc<P>, id: NodeId) {
        let retired = Box::into_raw(Box::new(Retired {
            pool: Arc::clone(pool),
            id,
        }));

        // SAFETY: `retired` came from Box::into_raw and is retired exactly once.
        unsafe {
            guard.defer_retire(retired, |ptr, _: &Collector| {
                let retired = Box::from_raw(ptr);
                retired.pool.release(retired.id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::DramPool;

    fn id(raw: u64) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    #[test]
    fn test_locate_segments() {
        assert_eq!(locate(id(1)), (0, 0));
        assert_eq!(locate(id(64)), (0, 63));
        assert_eq!(locate(id(65)), (1, 0));
        assert_eq!(locate(id(192)), (1, 127));
        assert_eq!(locate(id(193)), (2, 0));
    }

    #[test]
    fn test_get_before_and_after_allocate() {
        let arena = NodeArena::new(4);
        let pool = DramPool::new();
        assert!(arena.get(id(1)).is_none());

        let node = arena.allocate(&pool, 0).unwrap();
        assert_eq!(node.id(), id(1));
        assert_eq!(arena.get(id(1)).unwrap().id(), id(1));
        assert_eq!(node.capacity(), 4);
    }

    #[test]
    fn test_ids_across_segments() {
        let arena = NodeArena::new(3);
        let pool = DramPool::new();
        let mut last = None;
        for _ in 0..200 {
            last = Some(arena.allocate(&pool, 0).unwrap().id());
        }
        let last = last.unwrap();
        assert_eq!(last, id(200));
        assert_eq!(arena.get(last).unwrap().id(), last);
    }

    #[test]
    fn test_retire_releases_after_guard() {
        let arena = NodeArena::new(3);
        let pool = Arc::new(DramPool::new());
        let collector = Collector::new();
        let node = arena.allocate(pool.as_ref(), 0).unwrap().id();

        {
            let guard = collector.enter();
            arena.retire(&guard, &pool, node);
        }
        // retired objects are reclaimed at the latest when the collector drops
        drop(collector);
        assert_eq!(pool.live_nodes(), 0);
        assert_eq!(pool.stats().releases, 1);
    }
}
