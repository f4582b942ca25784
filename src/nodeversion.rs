//! Filepath: src/nodeversion.rs
//!
//! Write-epoch counter for optimistic node reads.
//!
//! [`NodeVersion`] is a seqlock counter: even means the node is stable, odd
//! means a write is in progress. A writer bumps it once before mutating and
//! once after, so each completed write advances it by two.
//!
//! # Concurrency Model
//! 1. Readers: call `stable()` to get an even epoch, read the node, call
//!    `has_changed()`; on change the snapshot may be torn and is retried.
//! 2. Writers: hold the node's writer lock, call `begin_write()` to get a
//!    [`WriteSection`], mutate, let the section drop.
//!
//! Only parity and equality are ever compared, never magnitude, so the
//! counter is free to wrap.
//!
//! ```rust
//! use fairtree::nodeversion::NodeVersion;
//!
//! let v = NodeVersion::new();
//! let before = v.stable();
//! {
//!     let _section = v.begin_write();
//!     assert!(v.is_writing());
//! }
//! assert!(v.has_changed(before));
//! ```

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::ordering::{RELAXED, UNLOCK_ORD, VERSION_ORD};

/// Spins before a reader starts yielding to the scheduler.
const SPIN_LIMIT: u32 = 64;

/// A seqlock write epoch.
#[derive(Debug)]
pub struct NodeVersion {
    epoch: AtomicU64,
}

/// Proof that a write is in progress on a node.
///
/// Created by [`NodeVersion::begin_write`], which moves the epoch to odd.
/// Dropping it moves the epoch to the next even value, even during
/// unwinding, so readers are never left spinning on an abandoned write.
#[derive(Debug)]
#[must_use = "dropping a write section immediately publishes an empty write"]
pub struct WriteSection<'a> {
    version: &'a NodeVersion,

    // !Send + !Sync: the section must end on the thread holding the node lock.
    _marker: PhantomData<*mut ()>,
}

impl Drop for WriteSection<'_> {
    fn drop(&mut self) {
        let value = self.version.epoch.load(RELAXED);
        debug_assert!(value % 2 == 1, "write section ended on even epoch");

        self.version.epoch.store(value.wrapping_add(1), UNLOCK_ORD);
    }
}

impl NodeVersion {
    /// A fresh, stable epoch (zero).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
        }
    }

    /// Create a version from a raw epoch.
    ///
    ///  WARN: ONLY FOR TESTING.
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self {
            epoch: AtomicU64::new(value),
        }
    }

    /// Raw epoch value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.epoch.load(RELAXED)
    }

    /// True while a writer is inside a write section.
    #[inline]
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.epoch.load(RELAXED) % 2 == 1
    }

    /// Number of completed writes encoded in a stable epoch.
    ///
    /// Its parity picks the scan direction of point lookups.
    #[inline]
    #[must_use]
    pub const fn write_cycles(stable: u64) -> u64 {
        stable / 2
    }

    // ========================================================================
    //  Reader side
    // ========================================================================

    /// Wait for an even epoch and return it.
    ///
    /// Spins briefly, then yields; bounded only by the writer finishing.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u64 {
        let mut spins: u32 = 0;
        loop {
            let value = self.epoch.load(VERSION_ORD);
            if value % 2 == 0 {
                return value;
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Check whether the epoch moved since `old` was read by [`stable`](Self::stable).
    ///
    /// The acquire fence orders every data load of the snapshot before the
    /// re-read of the epoch.
    #[inline]
    #[must_use]
    pub fn has_changed(&self, old: u64) -> bool {
        fence(Ordering::Acquire);
        self.epoch.load(RELAXED) != old
    }

    // ========================================================================
    //  Writer side
    // ========================================================================

    /// Enter a write section (epoch becomes odd).
    ///
    /// The caller must hold the node's writer lock: two overlapping write
    /// sections on one node would corrupt the parity.
    #[inline]
    pub fn begin_write(&self) -> WriteSection<'_> {
        let value = self.epoch.load(RELAXED);
        debug_assert!(value % 2 == 0, "begin_write on odd epoch");

        self.epoch.store(value.wrapping_add(1), RELAXED);
        // Data stores of the section must not become visible before the odd epoch.
        fence(Ordering::Release);

        WriteSection {
            version: self,
            _marker: PhantomData,
        }
    }

    /// Force the epoch to a value. Only for nodes nobody else can reach
    /// (fresh allocations and recovery).
    #[inline]
    pub fn reset(&self, value: u64) {
        self.epoch.store(value, UNLOCK_ORD);
    }
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(loom)]
mod loom_tests;
