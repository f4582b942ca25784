//! Insertion into a locked node, and node splits.
//!
//! # Split protocol
//!
//! A full node `N` splits around the median of its visible entries plus the
//! new one. Each step is persisted before the next starts, so a crash at
//! any point leaves every key reachable:
//!
//! 1. Allocate `S`, fill it with the upper half, `S.high = N.high`,
//!    `S.sibling = N.sibling`; persist the page. `S` is unreachable.
//! 2. `N.sibling = S`. `S` is reachable by move-right, but `N` still covers
//!    its keys, so nothing changed for readers.
//! 3. `N.high = sep`. Keys `>= sep` now route to `S`.
//! 4. Clear `N`'s slots at or above `sep` (already invisible), then insert
//!    the new entry on whichever side owns it.
//!
//! The separator is pushed into the parent level by the tree once the lock
//! on `N` is released.

use crate::error::PmemError;
use crate::key::Key;
use crate::layout::PersistRegion;
use crate::pmem::PmemPool;
use crate::slot::Entry;
use crate::tracing_helpers::trace_log;

use super::{Node, NodeCtx, NodeGuard, NodeId};

/// Result of [`Node::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A new entry was added.
    Inserted,
    /// The key was present; its pointer now holds the new value.
    Updated,
    /// The node split. The caller must insert `(separator, right)` one
    /// level up.
    Split {
        /// Lowest key now owned by `right`.
        separator: Key,
        /// The new right node.
        right: NodeId,
    },
    /// The key is at or above the fence; retry at the sibling.
    MoveRight(NodeId),
    /// The node was deleted; retry from the root.
    Deleted,
}

impl Node {
    /// Insert or overwrite `key -> ptr` in this node.
    ///
    /// For leaves `ptr` is a value; for internal nodes it is a child id.
    ///
    /// # Errors
    /// [`PmemError`] if a split needs a node the pool cannot provide. The
    /// node is unchanged in that case.
    pub fn store<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        ctx: &NodeCtx<'_, P>,
        key: Key,
        ptr: u64,
    ) -> Result<StoreOutcome, PmemError> {
        self.assert_owned(guard);
        debug_assert!(ptr != 0, "null pointer stored");

        if self.is_deleted() {
            return Ok(StoreOutcome::Deleted);
        }

        if key >= self.high_key() {
            return Ok(self
                .sibling()
                .map_or(StoreOutcome::Deleted, StoreOutcome::MoveRight));
        }

        if let Some(i) = self.find_visible(&key) {
            if self.slot(i).ptr() != ptr {
                guard.begin_write();
                self.slot(i).set_ptr(ptr);
                self.persist(ctx.pool, PersistRegion::SlotPtr(i));
            }
            return Ok(StoreOutcome::Updated);
        }

        if self.put_entry(guard, ctx.pool, Entry::new(key, ptr)) {
            return Ok(StoreOutcome::Inserted);
        }

        self.split(guard, ctx, Entry::new(key, ptr))
    }

    /// Split this full node while inserting `entry`.
    fn split<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        ctx: &NodeCtx<'_, P>,
        entry: Entry,
    ) -> Result<StoreOutcome, PmemError> {
        let mut entries = self.visible_unchecked();
        entries.push(entry);
        entries.sort_unstable_by_key(|e| e.key);

        let level = self.level();
        let mid = entries.len() / 2;
        let (separator, right_leftmost, upper) = if level == 0 {
            (entries[mid].key, None, &entries[mid..])
        } else {
            // the median's child becomes the right node's leftmost
            (
                entries[mid].key,
                NodeId::new(entries[mid].ptr),
                &entries[mid + 1..],
            )
        };

        let right = ctx.allocate(level)?;
        right.fill(right_leftmost, upper, self.high_key(), self.sibling());
        right.persist_page(ctx.pool);

        self.set_sibling(guard, ctx.pool, Some(right.id()));
        self.set_high_key(guard, ctx.pool, separator);

        for i in 0..self.scan_len() {
            let e = self.slot(i).load();
            if e.is_occupied() && e.key >= separator {
                self.clear_slot(guard, ctx.pool, i);
            }
        }

        if entry.key < separator {
            let placed = self.put_entry(guard, ctx.pool, entry);
            debug_assert!(placed, "lower half has no room after split");
        }
        self.shrink_last_index(guard, ctx.pool);

        trace_log!(
            node = %self.id(),
            right = %right.id(),
            level,
            ?separator,
            "split"
        );

        Ok(StoreOutcome::Split {
            separator,
            right: right.id(),
        })
    }
}
