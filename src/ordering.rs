//! Standard memory orderings for concurrent node access.
//!
//! These constants keep ordering choices consistent across the node,
//! arena and tree code.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields during optimistic traversal.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writing node fields inside a write section.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for relaxed loads (within a locked region, or counters).
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for loading the version at the start of an optimistic read.
pub const VERSION_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing a finished write (version back to even).
pub const UNLOCK_ORD: Ordering = Ordering::Release;

/// Ordering for root pointer swaps.
pub const ROOT_ORD: Ordering = Ordering::AcqRel;
