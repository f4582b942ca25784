//! Filepath: src/layout.rs
//!
//! Persisted byte layout of a node.
//!
//! A node occupies one page. The header sits at fixed offsets so that single
//! fields can be flushed without rewriting the page; slots follow back to back.
//!
//! # Memory Layout (512-byte page)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Cache Line 0 (64 bytes)                                      │
//! │   @0   sibling      u64   (0 = none)                         │
//! │   @8   leftmost     u64   (internal nodes only)              │
//! │   @16  level        u32                                      │
//! │   @20  version      u8    (low byte of the write epoch)      │
//! │   @21  deleted      u8                                       │
//! │   @22  last_index   i16   (-1 when empty)                    │
//! │   @24  high_key     [u8; 16]                                 │
//! │   @40  reserved     8 bytes                                  │
//! │   @48  slot 0       key [u8; 16] + ptr u64                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ... slots 1..18, 24 bytes each                               │
//! └──────────────────────────────────────────────────────────────┘
//! capacity = (512 - 48) / 24 = 19
//! ```
//!
//! All integers are little-endian; keys keep their byte order.

use std::ops::Range;

use crate::key::{KEY_LEN, Key};
use crate::slot::Entry;

/// Flush granularity of the persistent medium.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default page (node) size.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// Size of the node header.
pub const HEADER_SIZE: usize = 48;

/// Size of one slot.
pub const SLOT_SIZE: usize = KEY_LEN + 8;

const SIBLING_OFFSET: usize = 0;
const LEFTMOST_OFFSET: usize = 8;
const LEVEL_OFFSET: usize = 16;
const VERSION_OFFSET: usize = 20;
const DELETED_OFFSET: usize = 21;
const LAST_INDEX_OFFSET: usize = 22;
const HIGH_KEY_OFFSET: usize = 24;

/// Number of slots that fit in a page.
#[must_use]
pub const fn capacity_for(page_size: usize) -> usize {
    if page_size < HEADER_SIZE {
        return 0;
    }
    (page_size - HEADER_SIZE) / SLOT_SIZE
}

/// Smallest page size holding `capacity` slots.
#[must_use]
pub const fn page_size_for(capacity: usize) -> usize {
    HEADER_SIZE + capacity * SLOT_SIZE
}

/// Byte offset of slot `i`.
#[must_use]
#[inline(always)]
pub const fn slot_offset(i: usize) -> usize {
    HEADER_SIZE + i * SLOT_SIZE
}

/// Number of cache lines a persist of `[offset, offset + len)` flushes.
#[must_use]
pub const fn cache_lines(offset: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let first = offset / CACHE_LINE_SIZE;
    let last = (offset + len - 1) / CACHE_LINE_SIZE;
    last - first + 1
}

// ============================================================================
//  PersistRegion
// ============================================================================

/// A named byte range of a node, the unit handed to `persist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistRegion {
    /// The whole page (header and `capacity` slots).
    Page {
        /// Slot count of the page.
        capacity: usize,
    },
    /// The whole header.
    Header,
    /// The sibling link.
    Sibling,
    /// The leftmost-child link.
    Leftmost,
    /// The deleted flag.
    Deleted,
    /// `last_index`.
    LastIndex,
    /// The upper fence key.
    HighKey,
    /// Key and pointer of one slot.
    Slot(usize),
    /// Key of one slot.
    SlotKey(usize),
    /// Pointer of one slot.
    SlotPtr(usize),
}

impl PersistRegion {
    /// Byte range within the page.
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        match self {
            Self::Page { capacity } => 0..page_size_for(capacity),
            Self::Header => 0..HEADER_SIZE,
            Self::Sibling => SIBLING_OFFSET..SIBLING_OFFSET + 8,
            Self::Leftmost => LEFTMOST_OFFSET..LEFTMOST_OFFSET + 8,
            Self::Deleted => DELETED_OFFSET..DELETED_OFFSET + 1,
            Self::LastIndex => LAST_INDEX_OFFSET..LAST_INDEX_OFFSET + 2,
            Self::HighKey => HIGH_KEY_OFFSET..HIGH_KEY_OFFSET + KEY_LEN,
            Self::Slot(i) => slot_offset(i)..slot_offset(i) + SLOT_SIZE,
            Self::SlotKey(i) => slot_offset(i)..slot_offset(i) + KEY_LEN,
            Self::SlotPtr(i) => slot_offset(i) + KEY_LEN..slot_offset(i) + SLOT_SIZE,
        }
    }
}

// ============================================================================
//  Header image
// ============================================================================

/// Plain copy of a node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderImage {
    /// Right neighbour at the same level, 0 if none.
    pub sibling: u64,
    /// Child for keys below every slot key (internal nodes), 0 for leaves.
    pub leftmost: u64,
    /// 0 for leaves.
    pub level: u32,
    /// Low byte of the write epoch.
    pub version: u8,
    /// Node was merged away.
    pub deleted: bool,
    /// Highest slot index in use, -1 when none.
    pub last_index: i16,
    /// Exclusive upper fence.
    pub high_key: Key,
}

impl HeaderImage {
    /// Encode into the first [`HEADER_SIZE`] bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[SIBLING_OFFSET..SIBLING_OFFSET + 8].copy_from_slice(&self.sibling.to_le_bytes());
        out[LEFTMOST_OFFSET..LEFTMOST_OFFSET + 8].copy_from_slice(&self.leftmost.to_le_bytes());
        out[LEVEL_OFFSET..LEVEL_OFFSET + 4].copy_from_slice(&self.level.to_le_bytes());
        out[VERSION_OFFSET] = self.version;
        out[DELETED_OFFSET] = u8::from(self.deleted);
        out[LAST_INDEX_OFFSET..LAST_INDEX_OFFSET + 2]
            .copy_from_slice(&self.last_index.to_le_bytes());
        out[HIGH_KEY_OFFSET..HIGH_KEY_OFFSET + KEY_LEN].copy_from_slice(&self.high_key.to_bytes());
        out
    }

    /// Decode from a page prefix.
    ///
    /// # Errors
    /// Returns a description of the problem if the bytes are truncated or
    /// hold an impossible flag value.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("header truncated to {} bytes", bytes.len()));
        }

        let deleted = match bytes[DELETED_OFFSET] {
            0 => false,
            1 => true,
            other => return Err(format!("deleted flag holds {other}")),
        };

        Ok(Self {
            sibling: read_u64(bytes, SIBLING_OFFSET),
            leftmost: read_u64(bytes, LEFTMOST_OFFSET),
            level: u32::from_le_bytes(fixed(bytes, LEVEL_OFFSET)),
            version: bytes[VERSION_OFFSET],
            deleted,
            last_index: i16::from_le_bytes(fixed(bytes, LAST_INDEX_OFFSET)),
            high_key: Key::from_bytes(fixed(bytes, HIGH_KEY_OFFSET)),
        })
    }
}

// ============================================================================
//  Slot encoding
// ============================================================================

/// Encode one slot.
#[must_use]
pub fn encode_slot(entry: Entry) -> [u8; SLOT_SIZE] {
    let mut out = [0u8; SLOT_SIZE];
    out[..KEY_LEN].copy_from_slice(&entry.key.to_bytes());
    out[KEY_LEN..].copy_from_slice(&entry.ptr.to_le_bytes());
    out
}

/// Decode one slot from exactly [`SLOT_SIZE`] bytes at `offset`.
#[must_use]
pub fn decode_slot(bytes: &[u8], offset: usize) -> Entry {
    Entry::new(
        Key::from_bytes(fixed(bytes, offset)),
        read_u64(bytes, offset + KEY_LEN),
    )
}

/// A decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Header fields.
    pub header: HeaderImage,
    /// All `capacity` slots, half-written ones normalized to empty.
    pub slots: Vec<Entry>,
}

impl PageImage {
    /// Decode a durable page.
    ///
    /// A slot whose pointer never reached the medium is reported as
    /// [`Entry::EMPTY`], as is every slot past `last_index`.
    ///
    /// # Errors
    /// Returns a description when the page is too short or its header is
    /// inconsistent with `capacity`.
    pub fn decode(bytes: &[u8], capacity: usize) -> Result<Self, String> {
        let header = HeaderImage::decode(bytes)?;

        if bytes.len() < page_size_for(capacity) {
            return Err(format!(
                "page truncated to {} bytes, need {}",
                bytes.len(),
                page_size_for(capacity)
            ));
        }

        let last = i64::from(header.last_index);
        if last < -1 || last >= capacity as i64 {
            return Err(format!("last_index {last} outside capacity {capacity}"));
        }
        if header.level == 0 && header.leftmost != 0 {
            return Err("leaf with a leftmost child".to_string());
        }

        let slots = (0..capacity)
            .map(|i| {
                let entry = decode_slot(bytes, slot_offset(i));
                if (i as i64) > last || !entry.is_occupied() {
                    Entry::EMPTY
                } else {
                    entry
                }
            })
            .collect();

        Ok(Self { header, slots })
    }
}

#[inline]
fn fixed<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(fixed(bytes, offset))
}
