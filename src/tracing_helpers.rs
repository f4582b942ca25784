//! Zero-cost tracing helpers.
//!
//! With the `tracing` feature the macros forward to the `tracing` crate;
//! without it they expand to nothing.
//!
//! # Usage
//!
//! ```bash
//! # Normal build - no tracing overhead
//! cargo build --release
//!
//! # Tests with structural events (splits, merges, root changes, repairs)
//! cargo test --features tracing
//!
//! # One module at trace level
//! RUST_LOG=fairtree::tree=trace cargo test --features tracing stress
//! ```
//!
//! Levels used by the crate:
//! - `trace`: per-operation events (insert, delete, descent restarts, splits)
//! - `debug`: structural changes (merges, redistribution, root growth and
//!   collapse, recovery, pool exhaustion)
//! - `warn`: repairs of interrupted operations found on open

#![allow(unused_macros, unused_imports)]

/// Trace-level logging (most verbose). Compiles to no-op without `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        // Completely empty - zero cost
    };
}

/// Debug-level logging. Compiles to no-op without `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Warn-level logging. Compiles to no-op without `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_log {
    ($($arg:tt)*) => {};
}

// Export macros for use within crate
pub(crate) use debug_log;
pub(crate) use trace_log;
pub(crate) use warn_log;
