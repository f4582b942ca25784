//! Point lookups and range scans.
//!
//! Both are lock-free. A range scan walks the leaf chain from the leaf
//! covering `min`, collecting each validated leaf in key order and
//! following the sibling link while the leaf's fence is `<= max`. If a
//! leaf turns out to be deleted, the scan re-descends from the root at the
//! last fence it passed, so no key is reported twice.

use seize::LocalGuard;

use crate::key::Key;
use crate::node::{LeafSearch, RangeStep};
use crate::pmem::PmemPool;
use crate::tracing_helpers::trace_log;
use crate::value::ValuePtr;

use super::BTree;

impl<P: PmemPool + 'static> BTree<P> {
    /// Value stored under `key`.
    #[must_use]
    pub fn search(&self, key: &Key) -> Option<ValuePtr> {
        let guard = self.guard();
        self.search_with_guard(key, &guard)
    }

    /// [`search`](Self::search) inside an existing guard.
    #[must_use]
    pub fn search_with_guard(&self, key: &Key, _guard: &LocalGuard<'_>) -> Option<ValuePtr> {
        if key.is_infinity() {
            return None;
        }

        'restart: loop {
            let mut leaf = self.find_node(key, 0)?;
            loop {
                match leaf.linear_search(key) {
                    LeafSearch::Found(value) => return Some(value),
                    LeafSearch::NotFound => return None,
                    LeafSearch::MoveRight(next) => {
                        let Some(next) = self.node(next) else {
                            continue 'restart;
                        };
                        leaf = next;
                    }
                    LeafSearch::Restart => continue 'restart,
                }
            }
        }
    }

    /// Values of every key in `[min, max]`, in key order.
    #[must_use]
    pub fn range_scan(&self, min: &Key, max: &Key) -> Vec<ValuePtr> {
        let mut out = Vec::new();
        self.range_scan_into(min, max, &mut out);
        out
    }

    /// [`range_scan`](Self::range_scan) appending into `out`.
    pub fn range_scan_into(&self, min: &Key, max: &Key, out: &mut Vec<ValuePtr>) {
        out.extend(self.scan_entries(min, max).into_iter().map(|(_, v)| v));
    }

    /// Key/value pairs of every key in `[min, max]`, in key order.
    ///
    /// Empty when `min > max`.
    #[must_use]
    pub fn scan_entries(&self, min: &Key, max: &Key) -> Vec<(Key, ValuePtr)> {
        let guard = self.guard();
        self.scan_entries_with_guard(min, max, &guard)
    }

    /// [`scan_entries`](Self::scan_entries) inside an existing guard.
    #[must_use]
    pub fn scan_entries_with_guard(
        &self,
        min: &Key,
        max: &Key,
        _guard: &LocalGuard<'_>,
    ) -> Vec<(Key, ValuePtr)> {
        let mut out = Vec::new();
        if min > max {
            return out;
        }

        let mut from = *min;
        'restart: loop {
            let Some(mut leaf) = self.find_node(&from, 0) else {
                return out;
            };
            loop {
                match leaf.linear_search_range(&from, max, &mut out) {
                    RangeStep::Done => return out,

                    RangeStep::Continue { next, resume } => {
                        from = resume;
                        let Some(next) = self.node(next) else {
                            continue 'restart;
                        };
                        leaf = next;
                    }

                    RangeStep::Restart => {
                        trace_log!(?from, "range scan restart");
                        continue 'restart;
                    }
                }
            }
        }
    }
}
