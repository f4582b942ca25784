//! Filepath: src/slot.rs
//!
//! Slots: the `(key, pointer)` pairs stored in a node.
//!
//! A [`Slot`] lives inside a shared node and is read by lock-free readers
//! while a writer may be modifying it, so every field is an atomic word:
//! the key as two `u64` halves and the pointer as one `u64`. A torn read of
//! the three words is possible; the node's version check rejects it.
//!
//! # Occupancy
//! A slot is occupied iff its pointer is non-zero. Empty slots hold
//! [`KEY_INFINITY`] and a zero pointer. Writers publish a new entry by storing
//! the key first and the pointer last, and retract an entry by clearing the
//! pointer first, so the pointer word is always the commit point.
//!
//! In a leaf the pointer is a [`ValuePtr`](crate::value::ValuePtr); in an
//! internal node it is a child [`NodeId`](crate::node::NodeId).

use std::sync::atomic::AtomicU64;

use crate::key::{KEY_INFINITY, Key};
use crate::ordering::{READ_ORD, WRITE_ORD};

/// A key/pointer slot inside a node.
#[derive(Debug)]
pub struct Slot {
    key_hi: AtomicU64,
    key_lo: AtomicU64,
    ptr: AtomicU64,
}

/// A plain copy of a slot's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Slot key.
    pub key: Key,

    /// Raw pointer word (record reference or child id), zero when empty.
    pub ptr: u64,
}

impl Entry {
    /// The empty-slot encoding.
    pub const EMPTY: Self = Self {
        key: KEY_INFINITY,
        ptr: 0,
    };

    /// Build an entry.
    #[must_use]
    #[inline(always)]
    pub const fn new(key: Key, ptr: u64) -> Self {
        Self { key, ptr }
    }

    /// True when the pointer is set.
    #[must_use]
    #[inline(always)]
    pub const fn is_occupied(&self) -> bool {
        self.ptr != 0
    }
}

impl Slot {
    /// An empty slot.
    #[must_use]
    pub const fn empty() -> Self {
        let (hi, lo) = KEY_INFINITY.parts();
        Self {
            key_hi: AtomicU64::new(hi),
            key_lo: AtomicU64::new(lo),
            ptr: AtomicU64::new(0),
        }
    }

    /// Load the key.
    #[must_use]
    #[inline(always)]
    pub fn key(&self) -> Key {
        Key::from_parts(self.key_hi.load(READ_ORD), self.key_lo.load(READ_ORD))
    }

    /// Load the pointer word.
    #[must_use]
    #[inline(always)]
    pub fn ptr(&self) -> u64 {
        self.ptr.load(READ_ORD)
    }

    /// Load both fields. May be torn under a concurrent writer.
    #[must_use]
    #[inline(always)]
    pub fn load(&self) -> Entry {
        let ptr = self.ptr();
        Entry {
            key: self.key(),
            ptr,
        }
    }

    /// Store the key. Caller holds the node's write section.
    #[inline(always)]
    pub fn set_key(&self, key: Key) {
        let (hi, lo) = key.parts();
        self.key_hi.store(hi, WRITE_ORD);
        self.key_lo.store(lo, WRITE_ORD);
    }

    /// Store the pointer word. Caller holds the node's write section.
    #[inline(always)]
    pub fn set_ptr(&self, ptr: u64) {
        self.ptr.store(ptr, WRITE_ORD);
    }

    /// Overwrite the whole slot (key first, pointer last).
    #[inline]
    pub fn set(&self, entry: Entry) {
        self.set_key(entry.key);
        self.set_ptr(entry.ptr);
    }

    /// Reset to the empty encoding (pointer first, key last).
    #[inline]
    pub fn clear(&self) {
        self.set_ptr(0);
        self.set_key(KEY_INFINITY);
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::empty()
    }
}
