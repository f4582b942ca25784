//! Filepath: src/node.rs
//!
//! Tree node: a header plus a fixed array of unsorted slots.
//!
//! A [`Node`] is the in-memory image of one persistent page. Leaves
//! (`level == 0`) map keys to record references; internal nodes map
//! separator keys to child [`NodeId`]s and keep one extra child, `leftmost`,
//! for keys below every separator.
//!
//! # Slot discipline
//! Slots are not kept sorted. A new entry goes into the first hole at or
//! below `last_index`, or is appended at `last_index + 1`. Lookups are
//! linear. Sorting happens only when a node splits.
//!
//! A slot is *visible* when its pointer is set and its key is below the
//! node's `high_key`. Entries at or above the fence belong to the right
//! sibling and are ignored; they only exist transiently during splits and
//! merges (or after a crash in the middle of one).
//!
//! # Thread Safety
//! - **Readers** never lock. They follow the [`NodeVersion`] protocol:
//!   `stable()`, read, `has_changed()`, retry on change.
//! - **Writers** take the node's [`NodeGuard`] (one writer per node), open a
//!   write section with [`NodeGuard::begin_write`], mutate and persist, and
//!   let the guard drop.
//!
//! Operations that mutate take `&mut NodeGuard` as proof the lock is held.

use std::fmt as StdFmt;
use std::num::NonZeroU64;
use std::ops::{Deref, Range};
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64};

use parking_lot::{Mutex, MutexGuard};

use crate::arena::NodeArena;
use crate::error::PmemError;
use crate::key::{KEY_INFINITY, Key};
use crate::layout::{
    HEADER_SIZE, HeaderImage, PageImage, PersistRegion, SLOT_SIZE, encode_slot, slot_offset,
};
use crate::nodeversion::{NodeVersion, WriteSection};
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::pmem::PmemPool;
use crate::slot::{Entry, Slot};

mod remove;
mod search;
mod store;

pub use remove::RemoveOutcome;
pub use search::{LeafSearch, RangeStep, Route};
pub use store::StoreOutcome;

// ============================================================================
//  NodeId
// ============================================================================

/// Stable identifier of a node in the pool. Zero is reserved for "none".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(NonZeroU64);

impl NodeId {
    /// The first identifier a pool hands out.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Wrap a raw id; `None` for zero.
    #[must_use]
    #[inline(always)]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Raw value (never zero).
    #[must_use]
    #[inline(always)]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Encode an optional id as a link word.
    #[must_use]
    #[inline(always)]
    pub const fn encode(id: Option<Self>) -> u64 {
        match id {
            Some(id) => id.get(),
            None => 0,
        }
    }
}

impl StdFmt::Debug for NodeId {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl StdFmt::Display for NodeId {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
//  NodeCtx
// ============================================================================

/// What node operations need from the tree: the pool for persists and
/// allocation, and the arena to resolve identifiers.
#[derive(Debug)]
pub struct NodeCtx<'a, P: PmemPool> {
    /// Persistent-memory pool.
    pub pool: &'a P,
    /// Node storage.
    pub arena: &'a NodeArena,
}

impl<'a, P: PmemPool> NodeCtx<'a, P> {
    /// Bundle a pool and an arena.
    #[must_use]
    pub const fn new(pool: &'a P, arena: &'a NodeArena) -> Self {
        Self { pool, arena }
    }

    /// Allocate and reset a node at `level`.
    ///
    /// # Errors
    /// Propagates pool exhaustion.
    pub fn allocate(&self, level: u32) -> Result<&'a Node, PmemError> {
        self.arena.allocate(self.pool, level)
    }

    /// Resolve an id.
    #[must_use]
    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&'a Node> {
        self.arena.get(id)
    }
}

// ============================================================================
//  Node
// ============================================================================

/// One node of the tree.
pub struct Node {
    id: NodeId,

    /// Writer lock. Readers never touch it.
    lock: Mutex<()>,

    /// Write epoch for optimistic readers.
    version: NodeVersion,

    /// Right neighbour at the same level (0 = none).
    sibling: AtomicU64,

    /// Child for keys below every separator (internal nodes only).
    leftmost: AtomicU64,

    level: AtomicU32,

    deleted: AtomicBool,

    /// Highest slot index that may be occupied, -1 when none.
    last_index: AtomicI32,

    /// Exclusive upper fence, as two key halves.
    high_hi: AtomicU64,
    high_lo: AtomicU64,

    slots: Box<[Slot]>,
}

impl StdFmt::Debug for Node {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("level", &self.level())
            .field("last_index", &self.last_index())
            .field("high_key", &self.high_key())
            .field("sibling", &self.sibling())
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

/// A validated copy of a node's header and visible entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Header fields at the snapshot instant.
    pub header: HeaderImage,
    /// Visible entries, sorted by key.
    pub entries: Vec<Entry>,
}

impl Node {
    /// A blank leaf with `capacity` slots. Arena use only.
    #[must_use]
    pub(crate) fn new(id: NodeId, capacity: usize) -> Self {
        let (hi, lo) = KEY_INFINITY.parts();
        Self {
            id,
            lock: Mutex::new(()),
            version: NodeVersion::new(),
            sibling: AtomicU64::new(0),
            leftmost: AtomicU64::new(0),
            level: AtomicU32::new(0),
            deleted: AtomicBool::new(false),
            last_index: AtomicI32::new(-1),
            high_hi: AtomicU64::new(hi),
            high_lo: AtomicU64::new(lo),
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
        }
    }

    // ========================================================================
    //  Accessors (plain loads; validate with the version for consistency)
    // ========================================================================

    /// This node's identifier.
    #[must_use]
    #[inline(always)]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Slot count.
    #[must_use]
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Tree level (0 = leaf).
    #[must_use]
    #[inline(always)]
    pub fn level(&self) -> u32 {
        self.level.load(READ_ORD)
    }

    /// True for leaves.
    #[must_use]
    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    /// The write epoch.
    #[must_use]
    #[inline(always)]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Right neighbour.
    #[must_use]
    #[inline(always)]
    pub fn sibling(&self) -> Option<NodeId> {
        NodeId::new(self.sibling.load(READ_ORD))
    }

    /// Leftmost child (internal nodes).
    #[must_use]
    #[inline(always)]
    pub fn leftmost(&self) -> Option<NodeId> {
        NodeId::new(self.leftmost.load(READ_ORD))
    }

    /// Deleted flag.
    #[must_use]
    #[inline(always)]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(READ_ORD)
    }

    /// Highest possibly-occupied slot index, -1 when empty.
    #[must_use]
    #[inline(always)]
    pub fn last_index(&self) -> i32 {
        self.last_index.load(READ_ORD)
    }

    /// Exclusive upper fence.
    #[must_use]
    #[inline(always)]
    pub fn high_key(&self) -> Key {
        Key::from_parts(self.high_hi.load(READ_ORD), self.high_lo.load(READ_ORD))
    }

    /// Slot `i`.
    #[must_use]
    #[inline(always)]
    pub(crate) fn slot(&self, i: usize) -> &Slot {
        &self.slots[i]
    }

    /// Number of slots a scan must look at: `last_index + 1`, clamped.
    #[inline(always)]
    pub(crate) fn scan_len(&self) -> usize {
        let last = self.last_index();
        usize::try_from(last + 1).map_or(0, |n| n.min(self.capacity()))
    }

    /// Header fields (unvalidated).
    #[must_use]
    pub fn header(&self) -> HeaderImage {
        HeaderImage {
            sibling: self.sibling.load(READ_ORD),
            leftmost: self.leftmost.load(READ_ORD),
            level: self.level(),
            version: self.version.value().to_le_bytes()[0],
            deleted: self.is_deleted(),
            last_index: i16::try_from(self.last_index()).unwrap_or(i16::MAX),
            high_key: self.high_key(),
        }
    }

    /// Visible entries, unvalidated. Meaningful under the lock or inside a
    /// version-checked read.
    pub(crate) fn visible_unchecked(&self) -> Vec<Entry> {
        let high = self.high_key();
        (0..self.scan_len())
            .map(|i| self.slot(i).load())
            .filter(|e| e.is_occupied() && e.key < high)
            .collect()
    }

    /// Validated snapshot of header and visible entries (sorted).
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        loop {
            let v = self.version.stable();
            let header = self.header();
            let mut entries = self.visible_unchecked();
            if self.version.has_changed(v) {
                continue;
            }

            entries.sort_unstable_by_key(|e| e.key);
            return NodeSnapshot { header, entries };
        }
    }

    /// Number of visible entries (validated).
    #[must_use]
    pub fn live_count(&self) -> usize {
        loop {
            let v = self.version.stable();
            let n = self.visible_unchecked().len();
            if !self.version.has_changed(v) {
                return n;
            }
        }
    }

    /// Visible entries sorted by key (validated).
    #[must_use]
    pub fn visible_entries(&self) -> Vec<Entry> {
        self.snapshot().entries
    }

    /// Slots neither visible nor garbage, i.e. with a null pointer, plus
    /// the unused tail. Meaningful under the lock.
    #[must_use]
    pub(crate) fn free_slots(&self) -> usize {
        let occupied = (0..self.scan_len())
            .filter(|&i| self.slot(i).ptr() != 0)
            .count();
        self.capacity() - occupied
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    /// Acquire the writer lock.
    pub fn lock(&self) -> NodeGuard<'_> {
        NodeGuard {
            section: None,
            node: self,
            _lock: self.lock.lock(),
        }
    }

    // ========================================================================
    //  Persistence
    // ========================================================================

    /// Encode the bytes of `range` from the current in-memory state.
    #[must_use]
    pub fn encode_range(&self, range: Range<usize>) -> Vec<u8> {
        let mut out = Vec::with_capacity(range.len());
        let mut pos = range.start;

        if pos < HEADER_SIZE {
            let header = self.header().encode();
            let end = range.end.min(HEADER_SIZE);
            out.extend_from_slice(&header[pos..end]);
            pos = end;
        }

        while pos < range.end {
            let i = (pos - HEADER_SIZE) / SLOT_SIZE;
            let base = slot_offset(i);
            let bytes = if i < self.capacity() {
                encode_slot(self.slot(i).load())
            } else {
                [0u8; SLOT_SIZE]
            };
            let end = range.end.min(base + SLOT_SIZE);
            out.extend_from_slice(&bytes[pos - base..end - base]);
            pos = end;
        }

        out
    }

    /// Flush one region of this node to the pool.
    pub fn persist<P: PmemPool>(&self, pool: &P, region: PersistRegion) {
        let range = region.range();
        let bytes = self.encode_range(range.clone());
        pool.persist(self.id, range.start, &bytes);
    }

    /// Flush the whole page.
    pub fn persist_page<P: PmemPool>(&self, pool: &P) {
        self.persist(
            pool,
            PersistRegion::Page {
                capacity: self.capacity(),
            },
        );
    }

    // ========================================================================
    //  (Re)initialization: only for nodes no other thread can reach
    // ========================================================================

    /// Blank the node as a fresh node at `level`.
    pub(crate) fn reset(&self, level: u32) {
        let (hi, lo) = KEY_INFINITY.parts();
        self.version.reset(0);
        self.sibling.store(0, WRITE_ORD);
        self.leftmost.store(0, WRITE_ORD);
        self.level.store(level, WRITE_ORD);
        self.deleted.store(false, WRITE_ORD);
        self.last_index.store(-1, WRITE_ORD);
        self.high_hi.store(hi, WRITE_ORD);
        self.high_lo.store(lo, WRITE_ORD);
        for slot in &self.slots {
            slot.clear();
        }
    }

    /// Fill a freshly reset node with packed entries and links.
    pub(crate) fn fill(
        &self,
        leftmost: Option<NodeId>,
        entries: &[Entry],
        high_key: Key,
        sibling: Option<NodeId>,
    ) {
        debug_assert!(entries.len() <= self.capacity(), "fill overflows node");

        self.leftmost.store(NodeId::encode(leftmost), WRITE_ORD);
        self.sibling.store(NodeId::encode(sibling), WRITE_ORD);
        self.store_high_key(high_key);
        for (slot, entry) in self.slots.iter().zip(entries) {
            slot.set(*entry);
        }
        self.last_index.store(last_for_len(entries.len()), WRITE_ORD);
    }

    /// Load a decoded durable page.
    pub(crate) fn load_image(&self, image: &PageImage) {
        let h = &image.header;
        self.reset(h.level);
        self.leftmost.store(h.leftmost, WRITE_ORD);
        self.sibling.store(h.sibling, WRITE_ORD);
        self.store_high_key(h.high_key);
        self.deleted.store(h.deleted, WRITE_ORD);
        for (slot, entry) in self.slots.iter().zip(&image.slots) {
            slot.set(*entry);
        }
        self.last_index.store(i32::from(h.last_index), WRITE_ORD);
    }

    #[inline]
    fn store_high_key(&self, key: Key) {
        let (hi, lo) = key.parts();
        self.high_hi.store(hi, WRITE_ORD);
        self.high_lo.store(lo, WRITE_ORD);
    }

    // ========================================================================
    //  Write-section primitives (lock held, section open)
    // ========================================================================

    #[inline]
    fn assert_owned(&self, guard: &NodeGuard<'_>) {
        debug_assert!(StdPtr::eq(self, guard.node), "guard belongs to another node");
    }

    /// Put `entry` into the first hole, or append it. Returns false if full.
    ///
    /// A hole is published by its pointer store; an append by the
    /// `last_index` store. Either way the commit point is a single word
    /// persisted after the rest of the slot.
    pub(crate) fn put_entry<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        pool: &P,
        entry: Entry,
    ) -> bool {
        self.assert_owned(guard);

        let scan = self.scan_len();
        if let Some(i) = (0..scan).find(|&i| self.slot(i).ptr() == 0) {
            guard.begin_write();
            let slot = self.slot(i);
            slot.set_key(entry.key);
            self.persist(pool, PersistRegion::SlotKey(i));
            slot.set_ptr(entry.ptr);
            self.persist(pool, PersistRegion::SlotPtr(i));
            return true;
        }

        if scan >= self.capacity() {
            return false;
        }

        guard.begin_write();
        self.slot(scan).set(entry);
        self.persist(pool, PersistRegion::Slot(scan));
        self.last_index.store(last_for_len(scan + 1), WRITE_ORD);
        self.persist(pool, PersistRegion::LastIndex);
        true
    }

    /// Retract slot `i` (pointer first, then key).
    pub(crate) fn clear_slot<P: PmemPool>(&self, guard: &mut NodeGuard<'_>, pool: &P, i: usize) {
        self.assert_owned(guard);
        guard.begin_write();

        let slot = self.slot(i);
        slot.set_ptr(0);
        self.persist(pool, PersistRegion::SlotPtr(i));
        slot.set_key(KEY_INFINITY);
        self.persist(pool, PersistRegion::SlotKey(i));
    }

    /// Pull `last_index` down past trailing holes.
    pub(crate) fn shrink_last_index<P: PmemPool>(&self, guard: &mut NodeGuard<'_>, pool: &P) {
        self.assert_owned(guard);

        let scan = self.scan_len();
        let new_len = (0..scan)
            .rev()
            .find(|&i| self.slot(i).ptr() != 0)
            .map_or(0, |i| i + 1);

        if new_len != scan {
            guard.begin_write();
            self.last_index.store(last_for_len(new_len), WRITE_ORD);
            self.persist(pool, PersistRegion::LastIndex);
        }
    }

    /// Replace the upper fence.
    pub(crate) fn set_high_key<P: PmemPool>(&self, guard: &mut NodeGuard<'_>, pool: &P, key: Key) {
        self.assert_owned(guard);
        guard.begin_write();
        self.store_high_key(key);
        self.persist(pool, PersistRegion::HighKey);
    }

    /// Replace the sibling link.
    pub(crate) fn set_sibling<P: PmemPool>(
        &self,
        guard: &mut NodeGuard<'_>,
        pool: &P,
        sibling: Option<NodeId>,
    ) {
        self.assert_owned(guard);
        guard.begin_write();
        self.sibling.store(NodeId::encode(sibling), WRITE_ORD);
        self.persist(pool, PersistRegion::Sibling);
    }

    /// Set the deleted flag. Terminal.
    pub fn mark_deleted<P: PmemPool>(&self, guard: &mut NodeGuard<'_>, pool: &P) {
        self.assert_owned(guard);
        guard.begin_write();
        self.deleted.store(true, WRITE_ORD);
        self.persist(pool, PersistRegion::Deleted);
    }

    /// Index of the visible slot holding `key`. Lock held.
    pub(crate) fn find_visible(&self, key: &Key) -> Option<usize> {
        let high = self.high_key();
        if *key >= high {
            return None;
        }
        (0..self.scan_len()).find(|&i| {
            let e = self.slot(i).load();
            e.is_occupied() && e.key == *key
        })
    }

    #[cfg(test)]
    pub(crate) fn raw_last_index(&self) -> i32 {
        self.last_index()
    }
}

/// `last_index` value for `len` packed slots.
#[inline(always)]
fn last_for_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX) - 1
}

// ============================================================================
//  NodeGuard
// ============================================================================

/// Writer lock on a node, plus the write section once one is opened.
///
/// The section (if any) ends before the lock is released: `section` is
/// declared first so it drops first.
#[must_use = "dropping the guard releases the node lock"]
pub struct NodeGuard<'a> {
    section: Option<WriteSection<'a>>,
    node: &'a Node,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> NodeGuard<'a> {
    /// The locked node, with the guard's lifetime.
    #[must_use]
    #[inline(always)]
    pub const fn node(&self) -> &'a Node {
        self.node
    }

    /// Open the write section if it is not open yet (epoch becomes odd).
    #[inline]
    pub fn begin_write(&mut self) {
        if self.section.is_none() {
            self.section = Some(self.node.version.begin_write());
        }
    }

    /// Close the write section early (epoch becomes even). The lock stays held.
    #[inline]
    pub fn end_write(&mut self) {
        self.section = None;
    }

    /// True once `begin_write` was called and not yet ended.
    #[must_use]
    #[inline]
    pub const fn is_writing(&self) -> bool {
        self.section.is_some()
    }
}

impl Deref for NodeGuard<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.node
    }
}

impl StdFmt::Debug for NodeGuard<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("NodeGuard")
            .field("node", &self.node.id)
            .field("writing", &self.is_writing())
            .finish()
    }
}
