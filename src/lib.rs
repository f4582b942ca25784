//! # `fairtree`
//!
//! A concurrent, failure-atomic B+-tree for byte-addressable persistent
//! memory.
//!
//! Keys are fixed 16-byte values ordered as unsigned big-endian integers;
//! values are opaque non-null 64-bit record references. Nodes are fixed-size
//! pages of unsorted `(key, pointer)` slots plus a small header.
//!
//! | Feature | Status |
//! |---------|--------|
//! | Concurrent search / range scan | Lock-free, version-validated |
//! | Concurrent insert | One node lock at a time, B-link move-right |
//! | Delete | Merge and leaf redistribution, root collapse |
//! | Crash consistency | Ordered persists, repair on [`BTree::open`] |
//! | Node reclamation | Identities recycled after a `seize` grace period |
//!
//! ## Thread Safety
//!
//! `BTree<P>` is `Send + Sync`. Every operation takes `&self`:
//!
//! ```rust
//! use fairtree::{BTree, Key, ValuePtr};
//!
//! let tree = BTree::new();
//! let guard = tree.guard();
//!
//! tree.insert_with_guard(Key::from_u64(1), ValuePtr::new(10).unwrap(), &guard).unwrap();
//! assert!(tree.search_with_guard(&Key::from_u64(1), &guard).is_some());
//! ```
//!
//! ## Persistence
//!
//! The tree talks to the medium only through a [`PmemPool`]:
//! `allocate`/`release` node identities, `persist(id, offset, bytes)` with
//! ordering, and an atomic `swap_root`. [`DramPool`] is volatile;
//! [`ShadowPool`] keeps the byte image a power failure would leave and can
//! cut it off at any persist, which is how recovery is tested.
//!
//! ## Design
//!
//! - Each slot's pointer word is its commit point: written last on insert,
//!   cleared first on delete. Readers skip slots with a null pointer.
//! - Each node carries a high fence and a sibling link. A reader that
//!   lands on a node whose fence is not above its key moves right, so a
//!   split is visible as soon as the new node is linked.
//! - Each node's write epoch is odd while a writer is inside it; readers
//!   retry on any change.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

pub mod arena;
pub mod config;
pub mod error;
pub mod key;
pub mod layout;
pub mod node;
pub mod nodeversion;
pub mod ordering;
pub mod pmem;
pub mod slot;
pub mod tree;
pub mod value;

mod tracing_helpers;

pub use config::TreeConfig;
pub use error::{ConfigError, PmemError, TreeError};
pub use key::{KEY_INFINITY, KEY_LEN, KEY_ZERO, Key};
pub use node::NodeId;
pub use pmem::{DramPool, PersistStats, PmemPool, PoolImage, ShadowPool};
pub use tree::{BTree, NodeSummary, TreeStats};
pub use value::ValuePtr;
