//! Errors surfaced by the tree.
//!
//! Transient conditions (full node, torn read, stale sibling, a deleted node
//! reached during descent) are retried internally and never appear here.
//! Only pool exhaustion, misuse and unreadable durable images reach callers.

use std::fmt as StdFmt;

use crate::node::NodeId;

// ============================================================================
//  PmemError
// ============================================================================

/// Failures of the persistent-memory pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PmemError {
    /// The pool has no node left to hand out.
    Exhausted {
        /// Maximum number of live nodes the pool supports.
        limit: u64,
    },
}

impl StdFmt::Display for PmemError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Exhausted { limit } => write!(f, "pool exhausted ({limit} nodes)"),
        }
    }
}

impl std::error::Error for PmemError {}

// ============================================================================
//  ConfigError
// ============================================================================

/// Invalid [`TreeConfig`](crate::config::TreeConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The page cannot hold the header plus the minimum number of slots.
    PageTooSmall {
        /// Requested page size.
        page_size: usize,
        /// Smallest acceptable page size.
        minimum: usize,
    },

    /// The page size is not a multiple of 8 bytes.
    Misaligned {
        /// Requested page size.
        page_size: usize,
    },

    /// `min_fill` would make every merged node underflow again.
    MinFillTooLarge {
        /// Requested minimum fill.
        min_fill: usize,
        /// Node capacity.
        capacity: usize,
    },
}

impl StdFmt::Display for ConfigError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::PageTooSmall { page_size, minimum } => {
                write!(f, "page size {page_size} too small (minimum {minimum})")
            }

            Self::Misaligned { page_size } => {
                write!(f, "page size {page_size} is not a multiple of 8")
            }

            Self::MinFillTooLarge { min_fill, capacity } => {
                write!(f, "min_fill {min_fill} exceeds half of capacity {capacity}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
//  TreeError
// ============================================================================

/// Errors returned by tree operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// The pool could not provide a node. The tree is left in its last
    /// consistent state.
    AllocationFailure(PmemError),

    /// The key is the reserved `KEY_INFINITY` sentinel.
    ReservedKey,

    /// The configuration was rejected.
    Config(ConfigError),

    /// A durable page could not be decoded during recovery.
    CorruptPage {
        /// Page that failed to decode.
        id: NodeId,
        /// What was wrong with it.
        reason: String,
    },
}

impl StdFmt::Display for TreeError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::AllocationFailure(e) => write!(f, "node allocation failed: {e}"),

            Self::ReservedKey => write!(f, "key is the reserved infinity sentinel"),

            Self::Config(e) => write!(f, "invalid configuration: {e}"),

            Self::CorruptPage { id, reason } => write!(f, "corrupt page {id}: {reason}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AllocationFailure(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::ReservedKey | Self::CorruptPage { .. } => None,
        }
    }
}

impl From<PmemError> for TreeError {
    fn from(e: PmemError) -> Self {
        Self::AllocationFailure(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
