//! Filepath: src/key.rs
//!
//! Fixed-width keys for the tree.
//!
//! A [`Key`] is a 16-byte opaque sequence compared byte-by-byte. Internally
//! it is held as two big-endian `u64` halves so that comparing `(hi, lo)`
//! tuples gives exactly the lexicographic byte order, and so that a slot can
//! store a key in two atomic words.
//!
//! Two encodings are reserved:
//! - [`KEY_INFINITY`] (all `0xFF`): larger than every real key, marks empty
//!   slots and open upper fences.
//! - [`KEY_ZERO`] (all `0x00`): the default key.

use std::fmt as StdFmt;

/// Width of a key in bytes.
pub const KEY_LEN: usize = 16;

/// A fixed-width, totally ordered key.
///
/// # Example
///
/// ```rust
/// use fairtree::key::{Key, KEY_INFINITY};
///
/// let a = Key::from_u64(5);
/// let b = Key::from_u64(8);
///
/// assert!(a < b);
/// assert!(b < KEY_INFINITY);
/// assert_eq!(Key::from_bytes(a.to_bytes()), a);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    hi: u64,
    lo: u64,
}

/// Positive infinity. Never stored as a live key.
pub const KEY_INFINITY: Key = Key {
    hi: u64::MAX,
    lo: u64::MAX,
};

/// The all-zero key.
pub const KEY_ZERO: Key = Key { hi: 0, lo: 0 };

impl Key {
    /// Build a key from its 16 raw bytes.
    #[must_use]
    #[inline]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        let mut i = 0;
        while i < 8 {
            hi[i] = bytes[i];
            lo[i] = bytes[i + 8];
            i += 1;
        }

        Self {
            hi: u64::from_be_bytes(hi),
            lo: u64::from_be_bytes(lo),
        }
    }

    /// Build a key from a byte slice of at most [`KEY_LEN`] bytes.
    ///
    /// Shorter slices are zero-padded on the right, so `b"ab"` sorts before
    /// `b"ab\x01"`. Returns `None` if the slice is too long.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > KEY_LEN {
            return None;
        }

        let mut buf = [0u8; KEY_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self::from_bytes(buf))
    }

    /// Key whose byte order matches the numeric order of `n`.
    #[must_use]
    #[inline]
    pub const fn from_u64(n: u64) -> Self {
        Self { hi: 0, lo: n }
    }

    /// Rebuild a key from its two halves as stored in a slot.
    #[must_use]
    #[inline(always)]
    pub const fn from_parts(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// The two halves `(hi, lo)`.
    #[must_use]
    #[inline(always)]
    pub const fn parts(self) -> (u64, u64) {
        (self.hi, self.lo)
    }

    /// The 16 raw bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; KEY_LEN] {
        let hi = self.hi.to_be_bytes();
        let lo = self.lo.to_be_bytes();
        let mut out = [0u8; KEY_LEN];
        let mut i = 0;
        while i < 8 {
            out[i] = hi[i];
            out[i + 8] = lo[i];
            i += 1;
        }
        out
    }

    /// True for the [`KEY_INFINITY`] sentinel.
    #[must_use]
    #[inline(always)]
    pub const fn is_infinity(self) -> bool {
        self.hi == u64::MAX && self.lo == u64::MAX
    }

    /// The numeric value if this key was built by [`Key::from_u64`].
    #[must_use]
    pub const fn as_u64(self) -> Option<u64> {
        if self.hi == 0 { Some(self.lo) } else { None }
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Self::from_u64(n)
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl StdFmt::Debug for Key {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        if self.is_infinity() {
            return write!(f, "Key(+inf)");
        }

        match self.as_u64() {
            Some(n) => write!(f, "Key({n})"),
            None => write!(f, "Key({:016x}{:016x})", self.hi, self.lo),
        }
    }
}
