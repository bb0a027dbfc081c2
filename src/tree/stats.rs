//! Tree statistics and debug views

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use glam::Vec3;

use super::TreeSnapshot;
use super::node::{BLOCK_SIZE, Leaf, Node};
use crate::core::config::TreeConfig;
use crate::field::FieldSampler;

/// Width of a distance histogram bucket, in world units
pub const HISTOGRAM_BUCKET: f32 = 2.0;

/// Per-depth counts of reachable records
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LevelStats {
    /// Edge length of a node at this depth
    pub edge: f32,
    pub nodes: usize,
    pub interior: usize,
    pub sparsity_leaves: usize,
    pub lod_leaves: usize,
    /// LOD voxels of this edge length (64 per LOD leaf one level up)
    pub voxels: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TreeStats {
    /// Indexed by depth, `0..=max_depth + 1`
    pub levels: Vec<LevelStats>,
    /// Node arena length, including freed blocks
    pub node_records: usize,
    /// Leaf arena length, including freed slots
    pub leaf_records: usize,
    /// Reachable leaf distances bucketed by `floor(d / 2)`
    pub histogram: BTreeMap<i32, usize>,
}

impl TreeStats {
    pub fn collect(snapshot: &TreeSnapshot, config: &TreeConfig) -> Self {
        let mut levels: Vec<LevelStats> = (0..=config.max_depth + 1)
            .map(|depth| LevelStats {
                edge: if depth <= config.max_depth {
                    config.edge_at(depth)
                } else {
                    config.base_voxel_size * 0.25
                },
                ..Default::default()
            })
            .collect();
        let mut histogram = BTreeMap::new();

        let mut stack = vec![(0u32, 0usize)];
        while let Some((index, depth)) = stack.pop() {
            let Some(node) = snapshot.nodes.get(index as usize) else { continue };
            if depth >= levels.len() {
                continue;
            }
            levels[depth].nodes += 1;
            if node.is_interior() {
                levels[depth].interior += 1;
                let block = node.index();
                if block as usize + BLOCK_SIZE as usize <= snapshot.nodes.len() {
                    stack.extend((0..BLOCK_SIZE).map(|i| (block + i, depth + 1)));
                }
            } else if node.is_leaf() {
                let Some(leaf) = snapshot.leaves.get(node.index() as usize) else { continue };
                if leaf.is_lod() {
                    levels[depth].lod_leaves += 1;
                    if let Some(next) = levels.get_mut(depth + 1) {
                        next.voxels += BLOCK_SIZE as usize;
                    }
                    record_run(&mut histogram, snapshot, node);
                } else {
                    levels[depth].sparsity_leaves += 1;
                    record(&mut histogram, leaf);
                }
            }
        }

        Self {
            levels,
            node_records: snapshot.nodes.len(),
            leaf_records: snapshot.leaves.len(),
            histogram,
        }
    }

    pub fn reachable_nodes(&self) -> usize {
        self.levels.iter().map(|l| l.nodes).sum()
    }

    pub fn sparsity_leaves(&self) -> usize {
        self.levels.iter().map(|l| l.sparsity_leaves).sum()
    }

    pub fn lod_leaves(&self) -> usize {
        self.levels.iter().map(|l| l.lod_leaves).sum()
    }

    /// Bytes the two GPU buffers need for the current arenas
    pub fn gpu_bytes(&self) -> usize {
        self.node_records * std::mem::size_of::<Node>() + self.leaf_records * std::mem::size_of::<Leaf>()
    }

    /// Histogram as text, one bar per bucket.
    pub fn histogram_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Leaf Distance Distribution ===");
        for (&bucket, &count) in &self.histogram {
            let min = bucket as f32 * HISTOGRAM_BUCKET;
            let max = min + HISTOGRAM_BUCKET;
            let bar = "#".repeat((count / 10).min(50));
            let _ = writeln!(out, "{:8.1} to {:8.1}: {} {}", min, max, bar, count);
        }
        out
    }
}

fn record(histogram: &mut BTreeMap<i32, usize>, leaf: &Leaf) {
    let bucket = (leaf.distance / HISTOGRAM_BUCKET).floor() as i32;
    *histogram.entry(bucket).or_insert(0) += 1;
}

fn record_run(histogram: &mut BTreeMap<i32, usize>, snapshot: &TreeSnapshot, node: &Node) {
    let first = node.index() as usize;
    if let Some(run) = snapshot.leaves.get(first..first + BLOCK_SIZE as usize) {
        for leaf in run {
            record(histogram, leaf);
        }
    }
}

impl fmt::Display for TreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Tree Statistics ===")?;
        writeln!(f, "Node records: {}", self.node_records)?;
        writeln!(f, "Leaf records: {}", self.leaf_records)?;
        writeln!(f, "GPU bytes:    {:.2} MB", self.gpu_bytes() as f64 / (1024.0 * 1024.0))?;
        writeln!(f, "Per level:")?;
        for (depth, level) in self.levels.iter().enumerate() {
            writeln!(
                f,
                "  Level {:2} (edge {:>10.3}): {:>8} nodes, {:>8} interior, {:>8} sparse, {:>8} lod, {:>9} voxels",
                depth, level.edge, level.nodes, level.interior, level.sparsity_leaves, level.lod_leaves, level.voxels
            )?;
        }
        Ok(())
    }
}

/// ASCII slice of a field on the plane `z = slice_z`: `#` solid, `~` near the
/// surface, `.` empty. Rows run from +y at the top to -y at the bottom.
pub fn render_slice(sampler: &dyn FieldSampler, slice_z: f32, grid: usize, range: f32) -> String {
    let mut out = String::new();
    let step = range / grid as f32;
    for row in (0..grid).rev() {
        let y = -range / 2.0 + row as f32 * step;
        let _ = write!(out, "{:7.1} ", y);
        for col in 0..grid {
            let x = -range / 2.0 + col as f32 * step;
            let d = sampler.sample(Vec3::new(x, y, slice_z));
            out.push(if d < -0.5 {
                '#'
            } else if d > 0.5 {
                '.'
            } else {
                '~'
            });
        }
        out.push('\n');
    }
    out
}

/// Indented dump of the top `max_depth` levels of the tree, one node per line.
pub fn render_tree(snapshot: &TreeSnapshot, max_depth: u32) -> String {
    let mut out = String::new();
    dump_node(&mut out, snapshot, 0, 0, max_depth, "", true);
    out
}

fn dump_node(
    out: &mut String,
    snapshot: &TreeSnapshot,
    index: u32,
    depth: u32,
    max_depth: u32,
    prefix: &str,
    last: bool,
) {
    let Some(node) = snapshot.nodes.get(index as usize) else { return };
    let _ = write!(out, "{}{}", prefix, if last { "└── " } else { "├── " });
    if node.is_unset() {
        let _ = writeln!(out, "UNSET");
        return;
    }
    if node.is_leaf() {
        match snapshot.leaves.get(node.index() as usize) {
            Some(leaf) if leaf.is_lod() => {
                let _ = writeln!(out, "LOD [leaf={}, mask={:016x}]", node.index(), node.child_mask());
            }
            Some(leaf) => {
                let _ = writeln!(out, "LEAF [dist={:.2}]", leaf.distance);
            }
            None => {
                let _ = writeln!(out, "LEAF [invalid index {}]", node.index());
            }
        }
        return;
    }

    let block = node.index();
    let _ = writeln!(out, "NODE [children={}]", block);
    if depth >= max_depth {
        return;
    }
    let child_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
    for i in 0..BLOCK_SIZE {
        dump_node(out, snapshot, block + i, depth + 1, max_depth, &child_prefix, i == BLOCK_SIZE - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::LEAF_FLAG;

    fn config() -> TreeConfig {
        TreeConfig { max_depth: 3, base_voxel_size: 1.0, ..Default::default() }
    }

    #[test]
    fn test_collect_counts() {
        let mut nodes = vec![Node::EMPTY; 128];
        nodes[0] = Node::new(64, 0);
        let mut leaves: Vec<Leaf> = (0..64).map(|_| Leaf::voxel(-0.5)).collect();
        nodes[64] = Node::new(LEAF_FLAG, u64::MAX);
        for i in 1..64u32 {
            leaves.push(Leaf::sparsity(30.0));
            nodes[64 + i as usize] = Node::new(LEAF_FLAG | (63 + i), 0);
        }
        let snapshot = TreeSnapshot { nodes, leaves, root_center: Vec3::ZERO };
        let stats = TreeStats::collect(&snapshot, &config());

        assert_eq!(stats.levels.len(), 5);
        assert_eq!(stats.levels[0].nodes, 1);
        assert_eq!(stats.levels[0].interior, 1);
        assert_eq!(stats.levels[1].nodes, 64);
        assert_eq!(stats.levels[1].lod_leaves, 1);
        assert_eq!(stats.levels[1].sparsity_leaves, 63);
        assert_eq!(stats.levels[2].voxels, 64);
        assert_eq!(stats.reachable_nodes(), 65);
        assert_eq!(stats.gpu_bytes(), 128 * 16 + 127 * 8);

        // -0.5 -> bucket -1, 30.0 -> bucket 15
        assert_eq!(stats.histogram.get(&-1), Some(&64));
        assert_eq!(stats.histogram.get(&15), Some(&63));
        assert!(stats.histogram_text().contains("30.0 to"));
        assert!(stats.to_string().contains("Level  1"));
    }

    #[test]
    fn test_render_tree_depth_limit() {
        let mut nodes = vec![Node::EMPTY; 192];
        nodes[0] = Node::new(64, 0);
        nodes[64] = Node::new(128, 0);
        nodes[65] = Node::new(LEAF_FLAG, 0b101);
        let mut leaves = vec![Leaf::voxel(-1.0); 64];
        leaves.push(Leaf::sparsity(12.5));
        nodes[66] = Node::new(LEAF_FLAG | 64, 0);
        let snapshot = TreeSnapshot { nodes, leaves, root_center: Vec3::ZERO };

        let shallow = render_tree(&snapshot, 1);
        let lines: Vec<&str> = shallow.lines().collect();
        // Root plus its 64 children; grandchildren are cut off
        assert_eq!(lines.len(), 65);
        assert_eq!(lines[0], "└── NODE [children=64]");
        assert_eq!(lines[1], "    ├── NODE [children=128]");
        assert_eq!(lines[2], "    ├── LOD [leaf=0, mask=0000000000000005]");
        assert_eq!(lines[3], "    ├── LEAF [dist=12.50]");
        assert_eq!(lines[64], "    └── UNSET");

        let deep = render_tree(&snapshot, 2);
        assert_eq!(deep.lines().count(), 65 + 64);
        assert!(deep.lines().nth(2).unwrap().starts_with("    │   ├── UNSET"));
    }

    #[test]
    fn test_render_slice() {
        let floor = |p: Vec3| p.y;
        let slice = render_slice(&floor, 0.0, 8, 16.0);
        let rows: Vec<&str> = slice.lines().collect();
        assert_eq!(rows.len(), 8);
        // Top row is y = 6, bottom row is y = -8
        assert!(rows[0].ends_with("........"));
        assert!(rows[7].ends_with("########"));
        // Row for y = 0 sits on the surface
        assert!(rows[3].ends_with("~~~~~~~~"));
        assert!(rows[4].ends_with("########"));
    }
}
