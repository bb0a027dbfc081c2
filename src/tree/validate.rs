//! Structural checks over a tree snapshot.

use super::TreeSnapshot;
use super::geometry::child_center;
use super::node::{BLOCK_SIZE, INDEX_MASK};
use crate::core::config::TreeConfig;
use crate::field::bound::HALF_DIAGONAL;

/// Errors beyond this many are counted but not stored.
const MAX_REPORTED_ERRORS: usize = 32;

/// Result of walking the live tree from the root.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub nodes_visited: usize,
    pub interior: usize,
    pub sparsity_leaves: usize,
    pub lod_leaves: usize,
    /// Reachable nodes that were never subdivided
    pub unset: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.error_count == 0
    }

    fn error(&mut self, message: String) {
        self.error_count += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }
}

/// Walk the tree from node 0 and check:
///
/// - interior pointers reference a live, block-aligned child block;
/// - leaf pointers are in range, and LOD runs fit in the leaf arena;
/// - each LOD leaf's mask bit `i` equals `leaf[first + i].distance < 0`;
/// - sparsity leaves satisfy `|distance| >= s*sqrt(3)/2 - s*eps`;
/// - no node or leaf is reachable twice (no cycles, no sharing);
/// - no reachable node is unset.
pub fn validate(snapshot: &TreeSnapshot, config: &TreeConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let nodes = &snapshot.nodes;
    let leaves = &snapshot.leaves;
    let mut node_seen = vec![false; nodes.len()];
    let mut leaf_seen = vec![false; leaves.len()];

    for reserved in 1..(BLOCK_SIZE as usize).min(nodes.len()) {
        if !nodes[reserved].is_unset() {
            report.error(format!("reserved node {} is in use", reserved));
        }
    }

    let mut stack = vec![(0u32, 0u32, snapshot.root_center)];
    while let Some((index, depth, center)) = stack.pop() {
        let Some(node) = nodes.get(index as usize) else {
            report.error(format!("node index {} out of range", index));
            continue;
        };
        if std::mem::replace(&mut node_seen[index as usize], true) {
            report.error(format!("node {} reached twice", index));
            continue;
        }
        report.nodes_visited += 1;

        if node.is_unset() {
            report.unset += 1;
            report.error(format!("node {} at depth {} is unset", index, depth));
            continue;
        }

        let target = node.index();
        if node.is_leaf() {
            let Some(leaf) = leaves.get(target as usize) else {
                report.error(format!("node {} leaf index {} out of range", index, target));
                continue;
            };
            if leaf.is_lod() {
                report.lod_leaves += 1;
                check_lod_run(&mut report, snapshot, &mut leaf_seen, index, target, node.child_mask());
            } else {
                report.sparsity_leaves += 1;
                if std::mem::replace(&mut leaf_seen[target as usize], true) {
                    report.error(format!("leaf {} reached twice", target));
                }
                let edge = config.edge_at(depth);
                let min = edge * HALF_DIAGONAL - edge * config.surface_epsilon;
                if leaf.distance.abs() < min - 1e-4 * edge {
                    report.error(format!(
                        "sparsity leaf {} at depth {} has |d|={} < {}",
                        target, depth, leaf.distance.abs(), min
                    ));
                }
            }
            continue;
        }

        report.interior += 1;
        if target % BLOCK_SIZE != 0 || target == 0 {
            report.error(format!("node {} child pointer {} is not a block head", index, target));
            continue;
        }
        if target as usize + BLOCK_SIZE as usize > nodes.len() {
            report.error(format!("node {} child block {} past arena end", index, target));
            continue;
        }
        if depth >= config.max_depth {
            report.error(format!("node {} is interior at max depth {}", index, depth));
            continue;
        }
        let child_edge = config.edge_at(depth + 1);
        for i in 0..BLOCK_SIZE {
            stack.push((target + i, depth + 1, child_center(i, child_edge, center)));
        }
    }

    report
}

fn check_lod_run(
    report: &mut ValidationReport,
    snapshot: &TreeSnapshot,
    leaf_seen: &mut [bool],
    node: u32,
    first: u32,
    mask: u64,
) {
    let first = (first & INDEX_MASK) as usize;
    if first + BLOCK_SIZE as usize > snapshot.leaves.len() {
        report.error(format!("node {} LOD run {} past arena end", node, first));
        return;
    }
    for i in 0..BLOCK_SIZE as usize {
        let leaf = &snapshot.leaves[first + i];
        if std::mem::replace(&mut leaf_seen[first + i], true) {
            report.error(format!("leaf {} reached twice", first + i));
        }
        if !leaf.is_lod() {
            report.error(format!("leaf {} in LOD run {} lacks the LOD flag", first + i, first));
        }
        let solid = leaf.distance < 0.0;
        if solid != (mask >> i & 1 == 1) {
            report.error(format!("node {} mask bit {} disagrees with leaf {}", node, i, first + i));
        }
    }
}
