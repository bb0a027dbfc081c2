//! Staleness scan after observer motion.
//!
//! The builder's LOD decision for a non-sparse node at depth `d` is
//! "LOD leaf iff `d + 1 >= L(r)`". After the observer moves, a node is stale
//! when its realized shape disagrees with that decision under the new
//! observer:
//!
//! - a LOD leaf that would now subdivide (needs more detail);
//! - an interior node that would now stop (needs less detail).
//!
//! Sparsity leaves never go stale: their bound does not depend on the
//! observer. The scan does not descend below a stale interior node, so no two
//! reported tasks overlap.

use glam::Vec3;
use rayon::prelude::*;

use super::arena::Arenas;
use super::builder::Task;
use super::geometry::child_center;
use super::lod::LodPolicy;
use super::node::BLOCK_SIZE;
use crate::core::config::TreeConfig;

/// Find every highest stale node under the root's child block.
///
/// `root_block` is the first index of the root's 64 children (depth 1) and
/// `root_center` the center of the root cube.
pub fn scan(
    arenas: &Arenas,
    config: &TreeConfig,
    root_block: u32,
    root_center: Vec3,
    observer: Vec3,
) -> Vec<Task> {
    let lod = LodPolicy::from_config(config);
    let child_edge = config.edge_at(1);
    (0..BLOCK_SIZE)
        .into_par_iter()
        .flat_map_iter(|i| {
            let seed = Task {
                node: root_block + i,
                depth: 1,
                center: child_center(i, child_edge, root_center),
            };
            scan_subtree(arenas, config, &lod, seed, observer)
        })
        .collect()
}

/// Depth-first scan of one subtree with an explicit stack.
fn scan_subtree(
    arenas: &Arenas,
    config: &TreeConfig,
    lod: &LodPolicy,
    seed: Task,
    observer: Vec3,
) -> Vec<Task> {
    let mut stale = Vec::new();
    let mut stack = vec![seed];

    while let Some(task) = stack.pop() {
        let node = arenas.nodes.get(task.node);
        if node.is_unset() {
            continue;
        }
        let wants_lod_leaf = task.depth >= config.max_depth
            || lod.is_lod_leaf_depth(task.depth, task.center, observer);

        if node.is_leaf() {
            let leaf = arenas.leaves.get(node.index());
            if leaf.is_lod() && !wants_lod_leaf {
                stale.push(task);
            }
            continue;
        }

        if wants_lod_leaf {
            stale.push(task);
            continue;
        }

        let child_edge = config.edge_at(task.depth + 1);
        let block = node.index();
        for i in 0..BLOCK_SIZE {
            stack.push(Task {
                node: block + i,
                depth: task.depth + 1,
                center: child_center(i, child_edge, task.center),
            });
        }
    }
    stale
}
