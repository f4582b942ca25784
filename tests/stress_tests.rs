//! Stress tests for concurrent tree operations.
//!
//! Tiny nodes (3 to 8 slots) make every few keys a split or merge, so
//! these runs push many structure changes through the move-right and
//! rebalancing paths at once:
//! - Disjoint writers (inserts and deletes of their own keys)
//! - Readers and scanners racing writers
//! - Overlapping writers on a shared key range
//! - Repeated runs for intermittent bugs
//!
//! Run all stress tests:
//! ```bash
//! cargo test --test stress_tests --release
//! ```
//!
//! Run the long ones too:
//! ```bash
//! cargo test --test stress_tests --release -- --ignored
//! ```

#![allow(clippy::pedantic)]
#![expect(clippy::unwrap_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use fairtree::{BTree, DramPool, TreeConfig};

use common::{k, value_for};

// =============================================================================
// Test Configuration
// =============================================================================

fn tree(capacity: usize) -> Arc<BTree> {
    Arc::new(BTree::with_pool(DramPool::new(), TreeConfig::with_capacity(capacity)).unwrap())
}

/// Key owned by thread `t`: threads interleave so they share leaves.
fn owned(t: usize, i: usize, threads: usize) -> u64 {
    (i * threads + t) as u64 + 1
}

/// Verify the structure and that exactly `expected` keys are present.
fn verify(tree: &BTree, expected: impl Iterator<Item = u64>, test_name: &str) {
    let mut missing = Vec::new();
    let mut count = 0;
    for key in expected {
        count += 1;
        if tree.search(&k(key)) != Some(value_for(key)) {
            missing.push(key);
        }
    }

    if !missing.is_empty() {
        let sample: Vec<_> = missing.iter().take(20).collect();
        tracing::error!(test_name, missing = missing.len(), ?sample, "keys missing");
        tree.print_all();
        panic!(
            "{}: Missing {} keys (showing first 20): {:?}\n\
             tree.len()={}, expected={}",
            test_name,
            missing.len(),
            sample,
            tree.len(),
            count
        );
    }

    assert_eq!(tree.len(), count, "{test_name}: len");
    match tree.check_invariants() {
        Ok(stats) => tracing::info!(test_name, %stats, "verified"),
        Err(e) => {
            tree.print_all();
            panic!("{test_name}: {e}");
        }
    }
}

// =============================================================================
// INSERT TESTS
// =============================================================================

fn concurrent_inserts(threads: usize, per_thread: usize, capacity: usize) -> Arc<BTree> {
    let tree = tree(capacity);
    let verify_failures = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let verify_failures = Arc::clone(&verify_failures);
            thread::spawn(move || {
                let guard = tree.guard();
                for i in 0..per_thread {
                    let key = owned(t, i, threads);
                    tree.insert_with_guard(k(key), value_for(key), &guard)
                        .unwrap();

                    // Immediate verification
                    if tree.search_with_guard(&k(key), &guard).is_none() {
                        verify_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(
        verify_failures.load(Ordering::Relaxed),
        0,
        "insert not visible to its own thread"
    );
    tree
}

#[test]
fn insert_4_threads_capacity_3() {
    common::init_tracing();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 1000;

    let tree = concurrent_inserts(THREADS, PER_THREAD, 3);
    verify(&tree, 1..=(THREADS * PER_THREAD) as u64, "insert_4_threads_capacity_3");
}

#[test]
fn insert_8_threads_capacity_4() {
    common::init_tracing();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 1000;

    let tree = concurrent_inserts(THREADS, PER_THREAD, 4);
    verify(&tree, 1..=(THREADS * PER_THREAD) as u64, "insert_8_threads_capacity_4");
}

#[test]
fn insert_16_threads_default_pages() {
    common::init_tracing();

    const THREADS: usize = 16;
    const PER_THREAD: usize = 1000;

    let tree = Arc::new(BTree::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = owned(t, i, THREADS);
                    tree.insert(k(key), value_for(key)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    verify(&tree, 1..=(THREADS * PER_THREAD) as u64, "insert_16_threads_default_pages");
}

/// Every thread inserts the same keys: the last writer wins per key, and
/// each key exists once.
#[test]
fn insert_same_keys_from_all_threads() {
    common::init_tracing();

    const THREADS: usize = 8;
    const KEYS: u64 = 500;

    let tree = tree(4);
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for key in 1..=KEYS {
                    tree.insert(k(key), value_for(key)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    verify(&tree, 1..=KEYS, "insert_same_keys_from_all_threads");
}

// =============================================================================
// DELETE TESTS
// =============================================================================

/// Fill, then every thread deletes its own keys down to nothing.
#[test]
fn delete_all_4_threads_capacity_3() {
    common::init_tracing();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 1000;

    let tree = concurrent_inserts(THREADS, PER_THREAD, 3);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let guard = tree.guard();
                for i in 0..PER_THREAD {
                    let key = owned(t, i, THREADS);
                    assert!(tree.delete_with_guard(&k(key), &guard), "key {key} lost");
                    assert_eq!(tree.search_with_guard(&k(key), &guard), None);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    verify(&tree, std::iter::empty(), "delete_all_4_threads_capacity_3");
}

/// Half the threads delete the odd keys while the other half insert new
/// even keys.
#[test]
fn delete_while_inserting() {
    common::init_tracing();

    const KEYS: u64 = 4000;
    const THREADS: u64 = 4;

    let tree = tree(4);
    for key in (1..=KEYS).filter(|n| n % 2 == 1) {
        tree.insert(k(key), value_for(key)).unwrap();
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let guard = tree.guard();
                let mine = (1..=KEYS).filter(|n| n % THREADS == t);
                for key in mine {
                    if key % 2 == 1 {
                        assert!(tree.delete_with_guard(&k(key), &guard), "key {key} lost");
                    } else {
                        tree.insert_with_guard(k(key), value_for(key), &guard)
                            .unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    verify(&tree, (2..=KEYS).step_by(2), "delete_while_inserting");
}

// =============================================================================
// MIXED READ/WRITE TESTS
// =============================================================================

/// Readers never miss a key that was present before they started, while
/// writers split and merge the leaves around it.
#[test]
fn readers_see_stable_keys_during_churn() {
    common::init_tracing();

    const STABLE: u64 = 1000;
    const WRITERS: u64 = 3;
    const READERS: usize = 4;
    const ROUNDS: usize = 5;

    let tree = tree(4);
    // stable keys are multiples of 4; churn keys fill the gaps
    for key in (1..=STABLE).map(|n| n * 4) {
        tree.insert(k(key), value_for(key)).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (1..=WRITERS)
        .map(|w| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    for n in 1..=STABLE {
                        let key = n * 4 + w;
                        tree.insert(k(key), value_for(key)).unwrap();
                    }
                    for n in 1..=STABLE {
                        assert!(tree.delete(&k(n * 4 + w)));
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut passes = 0;
                while !done.load(Ordering::Acquire) || passes == 0 {
                    let guard = tree.guard();
                    for key in (1..=STABLE).map(|n| n * 4) {
                        assert_eq!(
                            tree.search_with_guard(&k(key), &guard),
                            Some(value_for(key)),
                            "stable key {key} missed"
                        );
                    }
                    passes += 1;
                }
            })
        })
        .collect();

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in readers {
        h.join().unwrap();
    }

    verify(&tree, (1..=STABLE).map(|n| n * 4), "readers_see_stable_keys_during_churn");
}

/// Range scans racing writers come out sorted and contain every stable key
/// in the range.
#[test]
fn scans_during_churn() {
    common::init_tracing();

    const STABLE: u64 = 500;
    const WRITERS: u64 = 2;
    const SCANNERS: usize = 3;

    let tree = tree(5);
    for key in (1..=STABLE).map(|n| n * 3) {
        tree.insert(k(key), value_for(key)).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (1..=WRITERS)
        .map(|w| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for _ in 0..4 {
                    for n in 1..=STABLE {
                        let key = n * 3 + w;
                        tree.insert(k(key), value_for(key)).unwrap();
                    }
                    for n in (1..=STABLE).rev() {
                        assert!(tree.delete(&k(n * 3 + w)));
                    }
                }
            })
        })
        .collect();

    let scanners: Vec<_> = (0..SCANNERS)
        .map(|s| {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let (lo, hi) = (s as u64 * 300, s as u64 * 300 + 900);
                while !done.load(Ordering::Acquire) {
                    let got = tree.scan_entries(&k(lo), &k(hi));
                    assert!(got.windows(2).all(|w| w[0].0 < w[1].0), "scan out of order");

                    let keys: Vec<u64> = got.iter().filter_map(|(key, _)| key.as_u64()).collect();
                    for stable in (lo..=hi).filter(|n| *n % 3 == 0 && *n > 0 && *n <= STABLE * 3) {
                        assert!(keys.binary_search(&stable).is_ok(), "scan missed {stable}");
                    }
                }
            })
        })
        .collect();

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in scanners {
        h.join().unwrap();
    }

    verify(&tree, (1..=STABLE).map(|n| n * 3), "scans_during_churn");
}

// =============================================================================
// REPEATED RUNS (catch intermittent bugs)
// =============================================================================

#[test]
fn repeated_10_runs_mixed() {
    common::init_tracing();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 300;

    for run in 0..10 {
        let _span = tracing::info_span!("run", run).entered();
        let tree = concurrent_inserts(THREADS, PER_THREAD, 3);

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in (0..PER_THREAD).filter(|i| i % 3 != 0) {
                        assert!(tree.delete(&k(owned(t, i, THREADS))));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let kept = (0..THREADS)
            .flat_map(|t| (0..PER_THREAD).filter(|i| i % 3 == 0).map(move |i| owned(t, i, THREADS)));
        verify(&tree, kept, &format!("repeated_10_runs_mixed run {run}"));
    }
}

#[test]
#[ignore = "long-running"]
fn extreme_100_runs_stress() {
    common::init_tracing();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    for run in 0..100 {
        let _span = tracing::info_span!("run", run).entered();
        let tree = concurrent_inserts(THREADS, PER_THREAD, 3);
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        assert!(tree.delete(&k(owned(t, i, THREADS))));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        verify(&tree, std::iter::empty(), &format!("extreme_100_runs_stress run {run}"));
    }
}

#[test]
#[ignore = "long-running"]
fn extreme_100k_keys() {
    common::init_tracing();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 12_500;

    let tree = concurrent_inserts(THREADS, PER_THREAD, 8);
    verify(&tree, 1..=(THREADS * PER_THREAD) as u64, "extreme_100k_keys");
}
