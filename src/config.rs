//! Tree configuration.
//!
//! Node size is the one structural knob: it fixes the slot capacity of every
//! node. The default 512-byte page holds 19 slots; tests use tiny pages to
//! force splits and merges with a handful of keys.

use crate::error::ConfigError;
use crate::layout::{DEFAULT_PAGE_SIZE, capacity_for, page_size_for};

/// Fewest slots a node may have. Internal splits push one key up and need
/// at least one key left on each side.
pub const MIN_CAPACITY: usize = 3;

/// Tree construction parameters.
///
/// # Example
///
/// ```rust
/// use fairtree::config::TreeConfig;
///
/// let config = TreeConfig::with_capacity(4);
/// assert_eq!(config.capacity(), 4);
/// assert_eq!(config.min_fill(), 2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    page_size: usize,
    min_fill: Option<usize>,
}

impl TreeConfig {
    /// Config for a given page size in bytes.
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self {
            page_size,
            min_fill: None,
        }
    }

    /// Config whose pages hold exactly `capacity` slots.
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self::new(page_size_for(capacity))
    }

    /// Override the underflow threshold.
    #[must_use]
    pub const fn with_min_fill(mut self, min_fill: usize) -> Self {
        self.min_fill = Some(min_fill);
        self
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Slots per node.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        capacity_for(self.page_size)
    }

    /// A non-root node with fewer visible entries than this is rebalanced.
    #[must_use]
    pub const fn min_fill(&self) -> usize {
        match self.min_fill {
            Some(n) => n,
            None => self.capacity() / 2,
        }
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size % 8 != 0 {
            return Err(ConfigError::Misaligned {
                page_size: self.page_size,
            });
        }

        if self.capacity() < MIN_CAPACITY {
            return Err(ConfigError::PageTooSmall {
                page_size: self.page_size,
                minimum: page_size_for(MIN_CAPACITY),
            });
        }

        if self.min_fill() > self.capacity() / 2 {
            return Err(ConfigError::MinFillTooLarge {
                min_fill: self.min_fill(),
                capacity: self.capacity(),
            });
        }

        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}
