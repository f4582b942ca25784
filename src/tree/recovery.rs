//! Reopening a tree from a pool's durable image.
//!
//! Every page in the image is decoded and loaded at its id; the persisted
//! root becomes the root. Slots whose write was cut short decode as empty,
//! and versions restart at zero.
//!
//! Each persist protocol leaves the tree searchable at every step, but a
//! crash can freeze it mid-way. [`BTree::open`] then finishes or undoes the
//! interrupted step, bottom level first:
//!
//! | Found on a level chain                         | Interrupted step      | Repair                         |
//! |------------------------------------------------|-----------------------|--------------------------------|
//! | node whose fence equals its left neighbour's   | split before fence, or merge after fence | unlink it          |
//! | parent separator below the left fence          | redistribution        | lower the left fence           |
//! | keys below the left neighbour's fence          | redistribution copy   | clear them                     |
//! | node no parent references                      | split or merge        | insert its separator           |
//! | more than one node at the root level           | root growth           | grow the root                  |
//!
//! Before that, slots at or above their node's fence are cleared: they are
//! copies a split or merge made before its fence moved. Afterwards every
//! page no chain reaches goes back to the pool.

use std::collections::{HashMap, HashSet};

use crate::arena::NodeArena;
use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::key::{KEY_INFINITY, KEY_ZERO, Key};
use crate::layout::PageImage;
use crate::node::{NodeGuard, NodeId};
use crate::pmem::PmemPool;
use crate::tracing_helpers::{debug_log, warn_log};

use super::BTree;
use super::inspect::NodeSummary;

/// A structural leftover of an interrupted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Defect {
    EmptyRange { left: NodeId, node: NodeId },
    LowerFence { left: NodeId, fence: Key },
    StrayKeys { node: NodeId, below: Key },
    Orphan { separator: Key, node: NodeId, level: u32 },
    WideRoot { level: u32 },
}

impl<P: PmemPool + 'static> BTree<P> {
    /// Rebuild the tree persisted in `pool`, or create an empty one if the
    /// pool has no root yet.
    ///
    /// # Errors
    /// - [`TreeError::Config`] for a rejected config.
    /// - [`TreeError::CorruptPage`] if a page does not decode or the root
    ///   page is missing.
    /// - [`TreeError::AllocationFailure`] if a repair needs a node.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn open(pool: P, config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        let Some(image) = pool.durable_image() else {
            return Self::with_pool(pool, config);
        };

        let arena = NodeArena::new(config.capacity());
        for (&id, bytes) in &image.pages {
            let page = PageImage::decode(bytes, config.capacity())
                .map_err(|reason| TreeError::CorruptPage { id, reason })?;
            let node = arena.slot(id).ok_or_else(|| TreeError::CorruptPage {
                id,
                reason: "id beyond arena range".into(),
            })?;
            node.load_image(&page);
        }

        let root = arena.get(image.root).ok_or_else(|| TreeError::CorruptPage {
            id: image.root,
            reason: "root page missing".into(),
        })?;
        let height = root.level();

        let tree = Self::assemble(pool, arena, config, image.root, height, 0);
        let swept = tree.sweep_above_fences();
        let repairs = tree.repair()?;
        let reclaimed = tree.reclaim_unreachable(image.pages.keys().copied());

        let keys = tree.scan_entries(&KEY_ZERO, &KEY_INFINITY).len();
        tree.count.store(keys, std::sync::atomic::Ordering::Relaxed);

        debug_log!(
            root = %image.root,
            height,
            pages = image.pages.len(),
            swept,
            repairs,
            reclaimed,
            keys,
            "tree recovered"
        );
        Ok(tree)
    }

    /// Fix leftovers of interrupted operations until none remain. Returns
    /// the number of repairs made.
    fn repair(&self) -> Result<usize, TreeError> {
        let guard = self.guard();
        let mut repairs = 0;

        while let Some(defect) = Self::find_defect(&self.levels()) {
            warn_log!(?defect, "repairing");
            repairs += 1;

            match defect {
                Defect::EmptyRange { left, node } => {
                    let (Some(l), Some(n)) = (self.node(left), self.node(node)) else {
                        break;
                    };
                    let mut lg = l.lock();
                    let mut ng = n.lock();
                    l.set_sibling(&mut lg, self.pool(), n.sibling());
                    n.mark_deleted(&mut ng, self.pool());
                    drop(ng);
                    drop(lg);
                    self.retire(&guard, node);
                }

                Defect::LowerFence { left, fence } => {
                    let Some(l) = self.node(left) else { break };
                    let mut lg = l.lock();
                    l.set_high_key(&mut lg, self.pool(), fence);
                    self.clear_from(&mut lg, fence);
                }

                Defect::StrayKeys { node, below } => {
                    let Some(n) = self.node(node) else { break };
                    let mut ng = n.lock();
                    for i in 0..n.scan_len() {
                        let e = n.slot(i).load();
                        if e.is_occupied() && e.key < below {
                            n.clear_slot(&mut ng, self.pool(), i);
                        }
                    }
                    n.shrink_last_index(&mut ng, self.pool());
                }

                Defect::Orphan {
                    separator,
                    node,
                    level,
                } => self.insert_internal(separator, node, level)?,

                Defect::WideRoot { level } => self.ensure_level(level + 1)?,
            }
        }

        Ok(repairs)
    }

    /// Clear copies left above a node's fence by a split or merge that
    /// stopped before its fence moved. Returns the number of nodes touched.
    fn sweep_above_fences(&self) -> usize {
        let mut swept = 0;
        for node in self.levels().iter().flatten() {
            let Some(n) = self.node(node.id) else { continue };
            let high = n.high_key();
            let stale = (0..n.scan_len()).any(|i| {
                let e = n.slot(i).load();
                e.is_occupied() && e.key >= high
            });
            if stale {
                let mut g = n.lock();
                self.clear_from(&mut g, high);
                swept += 1;
            }
        }
        swept
    }

    /// Hand back to the pool every page no level chain reaches: deleted
    /// nodes and pages written for a split that never got linked.
    fn reclaim_unreachable(&self, pages: impl Iterator<Item = NodeId>) -> usize {
        let reachable: HashSet<NodeId> = self.levels().iter().flatten().map(|n| n.id).collect();
        let mut reclaimed = 0;
        for id in pages.filter(|id| !reachable.contains(id)) {
            self.pool().release(id);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Clear every occupied slot at or above `from`.
    fn clear_from(&self, guard: &mut NodeGuard<'_>, from: Key) {
        let node = guard.node();
        for i in 0..node.scan_len() {
            let e = node.slot(i).load();
            if e.is_occupied() && e.key >= from {
                node.clear_slot(guard, self.pool(), i);
            }
        }
        node.shrink_last_index(guard, self.pool());
    }

    /// First defect, scanning levels bottom-up.
    fn find_defect(levels: &[Vec<NodeSummary>]) -> Option<Defect> {
        for depth in (0..levels.len()).rev() {
            let row = levels.get(depth)?;

            for pair in row.windows(2) {
                let (left, node) = (&pair[0], &pair[1]);
                if node.high_key <= left.high_key {
                    return Some(Defect::EmptyRange {
                        left: left.id,
                        node: node.id,
                    });
                }
            }

            let Some(parents) = depth.checked_sub(1).and_then(|d| levels.get(d)) else {
                if row.len() > 1 {
                    return row.first().map(|r| Defect::WideRoot { level: r.level });
                }
                continue;
            };

            // separator key of every child that has one
            let mut separators: HashMap<NodeId, Key> = HashMap::new();
            let mut referenced: Vec<NodeId> = Vec::new();
            for parent in parents {
                referenced.extend(parent.children.first().copied());
                for (key, child) in parent.keys.iter().zip(parent.children.iter().skip(1)) {
                    separators.entry(*child).or_insert(*key);
                    referenced.push(*child);
                }
            }

            for pair in row.windows(2) {
                let (left, node) = (&pair[0], &pair[1]);
                if let Some(&key) = separators.get(&node.id) {
                    if key < left.high_key {
                        return Some(Defect::LowerFence {
                            left: left.id,
                            fence: key,
                        });
                    }
                }
                if node.keys.first().is_some_and(|k| *k < left.high_key) {
                    return Some(Defect::StrayKeys {
                        node: node.id,
                        below: left.high_key,
                    });
                }
                if !referenced.contains(&node.id) {
                    return Some(Defect::Orphan {
                        separator: left.high_key,
                        node: node.id,
                        level: node.level + 1,
                    });
                }
            }
        }
        None
    }
}
