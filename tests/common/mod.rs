//! Shared helpers for integration tests.
//!
//! `init_tracing` installs a subscriber once per test binary: compact
//! output on stderr, plus NDJSON appended to `$FAIRTREE_LOG_DIR/fairtree.jsonl`
//! when that variable is set. `RUST_LOG` filters both (default `warn`), e.g.
//! `RUST_LOG=fairtree::tree=debug` to see splits, merges and recovery repairs.
//!
//! ```bash
//! FAIRTREE_LOG_DIR=logs RUST_LOG=fairtree=debug cargo test --features tracing --test crash_recovery
//! jq 'select(.level == "WARN")' logs/fairtree.jsonl
//! ```

#![allow(dead_code)]

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use fairtree::{Key, ValuePtr};

static INIT: Once = Once::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the test subscriber. Later calls are no-ops.
pub fn init_tracing() {
    INIT.call_once(|| {
        let console = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_names(true)
            .with_target(true)
            .compact()
            .with_filter(filter());

        // Tests in one binary share the file; append so nextest processes interleave.
        let json = std::env::var_os("FAIRTREE_LOG_DIR")
            .map(PathBuf::from)
            .and_then(|dir| {
                std::fs::create_dir_all(&dir).ok()?;
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("fairtree.jsonl"))
                    .ok()
            })
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .with_filter(filter())
            });

        let _ = Registry::default().with(console).with(json).try_init();
    });
}

/// Integer key.
pub fn k(n: u64) -> Key {
    Key::from_u64(n)
}

/// Value reference `n` (non-zero).
#[expect(clippy::expect_used)]
pub fn v(n: u64) -> ValuePtr {
    ValuePtr::new(n).expect("value references are non-zero")
}

/// Value stored for key `n` by tests that derive values from keys.
pub fn value_for(n: u64) -> ValuePtr {
    v(n.wrapping_mul(31).wrapping_add(7) | 1)
}
