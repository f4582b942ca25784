//! Record references stored in leaf slots.
//!
//! The tree never interprets a payload: a leaf slot holds an opaque, non-null
//! 64-bit reference to a record living elsewhere in the persistent pool. Null
//! (zero) is reserved for "empty slot", which is why [`ValuePtr`] wraps a
//! [`NonZeroU64`].

use std::fmt as StdFmt;
use std::num::NonZeroU64;

/// Opaque, non-null reference to a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValuePtr(NonZeroU64);

impl ValuePtr {
    /// Wrap a raw reference. Returns `None` for zero.
    #[must_use]
    #[inline(always)]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// The raw 64-bit reference (never zero).
    #[must_use]
    #[inline(always)]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for ValuePtr {
    fn from(nz: NonZeroU64) -> Self {
        Self(nz)
    }
}

impl StdFmt::Debug for ValuePtr {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "ValuePtr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rejected() {
        assert!(ValuePtr::new(0).is_none());
        assert_eq!(ValuePtr::new(9).map(ValuePtr::get), Some(9));
    }

    #[test]
    fn test_option_is_word_sized() {
        assert_eq!(size_of::<Option<ValuePtr>>(), size_of::<u64>());
    }
}
