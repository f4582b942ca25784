//! Structural dumps and consistency checks.
//!
//! These walk the sibling chain of every level from the root down. They
//! are meant for tests, debugging and recovery; under concurrent writers
//! each node is individually consistent but the picture as a whole may mix
//! instants.

use std::fmt as StdFmt;

use crate::key::{KEY_INFINITY, Key};
use crate::node::{Node, NodeId};
use crate::pmem::PmemPool;

use super::BTree;

/// One node as seen by [`BTree::levels`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    /// Node id.
    pub id: NodeId,
    /// Level (0 = leaf).
    pub level: u32,
    /// Exclusive upper fence.
    pub high_key: Key,
    /// Right neighbour.
    pub sibling: Option<NodeId>,
    /// Deleted flag.
    pub deleted: bool,
    /// Visible keys, sorted.
    pub keys: Vec<Key>,
    /// Children in key order (`leftmost` first); empty for leaves.
    pub children: Vec<NodeId>,
}

impl NodeSummary {
    fn of(node: &Node) -> Self {
        let snap = node.snapshot();
        let mut children = Vec::new();
        if snap.header.level > 0 {
            children.extend(NodeId::new(snap.header.leftmost));
            children.extend(snap.entries.iter().filter_map(|e| NodeId::new(e.ptr)));
        }
        Self {
            id: node.id(),
            level: snap.header.level,
            high_key: snap.header.high_key,
            sibling: NodeId::new(snap.header.sibling),
            deleted: snap.header.deleted,
            keys: snap.entries.iter().map(|e| e.key).collect(),
            children,
        }
    }
}

/// Shape of a tree that passed [`BTree::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Root level.
    pub height: u32,
    /// Nodes per level, root level first.
    pub nodes_per_level: Vec<usize>,
    /// Keys in the leaves.
    pub keys: usize,
}

impl StdFmt::Display for TreeStats {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(
            f,
            "height {} keys {} nodes {:?}",
            self.height, self.keys, self.nodes_per_level
        )
    }
}

impl<P: PmemPool + 'static> BTree<P> {
    /// Every level's sibling chain, root level first.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<NodeSummary>> {
        let _guard = self.guard();
        let mut out: Vec<Vec<NodeSummary>> = Vec::new();

        let mut start = self.root_node();
        while let Some(first) = start {
            let mut row = Vec::new();
            let mut cursor = Some(first);
            while let Some(node) = cursor {
                let summary = NodeSummary::of(node);
                cursor = summary.sibling.and_then(|id| self.node(id));
                row.push(summary);
            }

            start = row
                .first()
                .filter(|s| s.level > 0)
                .and_then(|s| s.children.first())
                .and_then(|&id| self.node(id));
            out.push(row);
        }
        out
    }

    /// Print every level to stderr.
    pub fn print_all(&self) {
        for row in self.levels() {
            let Some(level) = row.first().map(|s| s.level) else {
                continue;
            };
            eprintln!("level {level}:");
            for node in row {
                eprintln!(
                    "  {:?} high={:?} sibling={:?} keys={:?}",
                    node.id, node.high_key, node.sibling, node.keys
                );
            }
        }
    }

    /// Check the structure of a quiescent tree.
    ///
    /// Verifies, level by level: node levels match, fences strictly
    /// increase along each chain and end at infinity, every key lies in its
    /// node's range, every child of a level is referenced exactly once by
    /// the level above in chain order with its left neighbour's fence as
    /// separator, and the key count matches [`len`](Self::len).
    ///
    /// # Errors
    /// A description of the first violation found.
    pub fn check_invariants(&self) -> Result<TreeStats, String> {
        let levels = self.levels();
        let height = self.height();

        if levels.len() != height as usize + 1 {
            return Err(format!(
                "height {height} but {} levels reachable",
                levels.len()
            ));
        }
        if levels.first().map_or(0, Vec::len) != 1 {
            return Err("root has a sibling".into());
        }

        let mut keys = 0;
        for (depth, row) in levels.iter().enumerate() {
            let expected = height - u32::try_from(depth).map_err(|e| e.to_string())?;
            let mut low: Option<Key> = None;

            for node in row {
                if node.level != expected {
                    return Err(format!("{:?} at level {} in row {expected}", node.id, node.level));
                }
                if node.deleted {
                    return Err(format!("{:?} is deleted but linked", node.id));
                }
                if low.is_some_and(|l| node.high_key <= l) {
                    return Err(format!("{:?} has an empty range", node.id));
                }
                if node.keys.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(format!("{:?} has duplicate keys", node.id));
                }
                if let Some(bad) = node
                    .keys
                    .iter()
                    .find(|k| **k >= node.high_key || low.is_some_and(|l| **k < l))
                {
                    return Err(format!("{:?} holds {bad:?} outside its range", node.id));
                }
                if node.level == 0 {
                    keys += node.keys.len();
                }
                low = Some(node.high_key);
            }

            if let Some(last) = row.last() {
                if last.high_key != KEY_INFINITY || last.sibling.is_some() {
                    return Err(format!("{:?} ends level {expected} but is bounded", last.id));
                }
            }

            if let Some(below) = levels.get(depth + 1) {
                Self::check_children(row, below)?;
            }
        }

        if keys != self.len() {
            return Err(format!("{keys} keys in leaves, len() is {}", self.len()));
        }

        Ok(TreeStats {
            height,
            nodes_per_level: levels.iter().map(Vec::len).collect(),
            keys,
        })
    }

    /// Parents in `row` must reference exactly the chain `below`, in order,
    /// keyed by fences.
    fn check_children(row: &[NodeSummary], below: &[NodeSummary]) -> Result<(), String> {
        let children: Vec<NodeId> = row.iter().flat_map(|p| p.children.iter().copied()).collect();
        let chain: Vec<NodeId> = below.iter().map(|n| n.id).collect();
        if children != chain {
            return Err(format!("children {children:?} but chain {chain:?}"));
        }

        let mut index = 0;
        for parent in row {
            for (j, &child) in parent.children.iter().enumerate() {
                if j > 0 {
                    let separator = parent.keys[j - 1];
                    let fence = below[index - 1].high_key;
                    if separator != fence {
                        return Err(format!(
                            "separator {separator:?} for {child:?} but left fence {fence:?}"
                        ));
                    }
                }
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TreeConfig;
    use crate::key::Key;
    use crate::pmem::DramPool;
    use crate::tree::BTree;
    use crate::value::ValuePtr;

    #[test]
    fn test_levels_of_fresh_tree() {
        let t = BTree::new();
        let levels = t.levels();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 1);
        assert!(levels[0][0].keys.is_empty());

        let stats = t.check_invariants().unwrap();
        assert_eq!(stats.height, 0);
        assert_eq!(stats.keys, 0);
    }

    #[test]
    fn test_stats_after_growth() {
        let t = BTree::with_pool(DramPool::new(), TreeConfig::with_capacity(4)).unwrap();
        for i in 1..=64u64 {
            t.insert(Key::from_u64(i), ValuePtr::new(i).unwrap()).unwrap();
        }
        let stats = t.check_invariants().unwrap();
        assert_eq!(stats.keys, 64);
        assert_eq!(stats.nodes_per_level.len() as u32, stats.height + 1);
        assert_eq!(stats.nodes_per_level[0], 1);
        assert!(stats.height >= 2, "{stats}");
    }
}
