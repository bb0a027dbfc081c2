//! Sparse distance octree
//!
//! A 64-ary tree of signed-distance records built in parallel from a
//! [`FieldSampler`]. Far from the surface a node stores a single
//! Lipschitz-safe bound (sparsity leaf); near it the tree refines until the
//! observer-driven LOD schedule stops it with a 4x4x4 block of voxel
//! distances (LOD leaf).
//!
//! [`Tree`] owns the worker pool, both arenas, the staleness queue and the
//! optional GPU mirror. All of its methods are called from one control
//! thread; each call returns once the workers have finished.

pub mod arena;
pub mod builder;
pub mod geometry;
pub mod lod;
pub mod node;
pub mod stale;
pub mod stats;
pub mod validate;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use glam::Vec3;

use self::arena::{Arenas, FreedCounts};
use self::builder::{Shared, Task, worker_loop};
use self::geometry::child_center;
use self::node::{BLOCK_SIZE, Leaf, Node};
use self::stats::TreeStats;
use self::validate::ValidationReport;
use crate::core::config::TreeConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::field::FieldSampler;
use crate::render::buffer::TreeBuffers;
use crate::sync::WorkChannel;

/// Node index of the root record
pub const ROOT_INDEX: u32 = 0;
/// World-space center of the root cube
pub const ROOT_CENTER: Vec3 = Vec3::ZERO;

/// Host copy of both arenas, laid out exactly as uploaded to the GPU.
#[derive(Clone, Debug, Default)]
pub struct TreeSnapshot {
    pub nodes: Vec<Node>,
    pub leaves: Vec<Leaf>,
    pub root_center: Vec3,
}

pub struct Tree {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// First index of the root's child block
    root_block: u32,
    /// Observer accepted by the last `build` or `move_observer`
    last_observer: Vec3,
    /// Observer the current tree shape was built for
    rebuild_observer: Vec3,
    /// Stale nodes found by the last scan, waiting for `update_stale_lods`
    stale: WorkChannel<Task>,
    buffers: Option<TreeBuffers>,
    destroyed: bool,
}

impl Tree {
    /// Spawn the worker pool and lay out the root. Nothing is sampled until
    /// [`Tree::build`].
    pub fn new(config: TreeConfig, sampler: impl FieldSampler + 'static) -> Result<Self> {
        let worker_count = config.resolved_worker_count();
        let shared = Arc::new(Shared::new(config, Box::new(sampler)));

        let root_block = shared.arenas.nodes.alloc_block();
        shared.arenas.nodes.set(ROOT_INDEX, root_block, 0);

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("sdo-builder-{}", id))
                .spawn(move || worker_loop(&shared, id))?;
            workers.push(handle);
        }
        log::info!("Tree created with {} builder workers", worker_count);

        Ok(Self {
            shared,
            workers,
            root_block,
            last_observer: Vec3::ZERO,
            rebuild_observer: Vec3::ZERO,
            stale: WorkChannel::new(0),
            buffers: None,
            destroyed: false,
        })
    }

    /// Build the whole tree for `observer`, replacing any previous build.
    pub fn build(&mut self, observer: Vec3) -> Result<()> {
        self.shared.config.validate()?;
        if self.destroyed {
            return Err(Error::Closed);
        }
        let start = Instant::now();

        let freed = self.free_root_children();
        if freed.blocks > 0 {
            log::debug!(
                "Released previous build: {} blocks, {} sparsity leaves, {} LOD runs",
                freed.blocks,
                freed.sparsity_leaves,
                freed.lod_runs
            );
        }
        self.stale.drain();
        self.set_observer(observer);
        self.shared.counters.take();

        let child_edge = self.shared.config.edge_at(1);
        let root_block = self.root_block;
        let seeds: Vec<Task> = (0..BLOCK_SIZE)
            .map(|i| Task {
                node: root_block + i,
                depth: 1,
                center: child_center(i, child_edge, ROOT_CENTER),
            })
            .collect();
        self.run(seeds)?;
        self.rebuild_observer = observer;

        let (interior, sparse, lod) = self.shared.counters.take();
        log::info!(
            "Built tree in {:.1}ms: {} interior, {} sparsity leaves, {} LOD leaves ({} nodes, {} leaves)",
            start.elapsed().as_secs_f64() * 1000.0,
            interior + 1,
            sparse,
            lod,
            self.shared.arenas.nodes.len(),
            self.shared.arenas.leaves.len()
        );

        if cfg!(debug_assertions) {
            let report = self.validate();
            if !report.is_valid() {
                log::error!(
                    "Tree failed validation with {} errors: {:?}",
                    report.error_count,
                    report.errors
                );
            }
        }

        if let Some(buffers) = &mut self.buffers {
            buffers.upload_full(&self.shared.arenas)?;
        }
        Ok(())
    }

    /// Record a new observer position and queue every node whose LOD no
    /// longer matches it. Returns the number of nodes queued.
    ///
    /// Moves shorter than `observer_threshold` are ignored.
    pub fn move_observer(&mut self, position: Vec3) -> usize {
        if self.destroyed {
            return 0;
        }
        if position.distance(self.last_observer) < self.shared.config.observer_threshold {
            return 0;
        }
        self.set_observer(position);

        // Every accepted move rescans from the root, so older entries are superseded
        self.stale.drain();
        let start = Instant::now();
        let tasks = stale::scan(
            &self.shared.arenas,
            &self.shared.config,
            self.root_block,
            ROOT_CENTER,
            position,
        );
        let count = tasks.len();
        if let Err(e) = self.stale.send_many(tasks) {
            log::warn!("Dropping stale nodes: {}", e);
            return 0;
        }
        log::info!(
            "Observer moved {:.1} from last rebuild: {} stale nodes ({:.1}ms)",
            position.distance(self.rebuild_observer),
            count,
            start.elapsed().as_secs_f64() * 1000.0
        );
        count
    }

    /// Rebuild every queued stale node for the current observer and sync the
    /// GPU mirror if one is attached. Returns the number of nodes rebuilt.
    pub fn update_stale_lods(&mut self) -> Result<usize> {
        if self.destroyed {
            return Err(Error::Closed);
        }
        let tasks = self.stale.drain();
        if tasks.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();
        let count = tasks.len();

        let mut freed = FreedCounts::default();
        for task in &tasks {
            let f = self.shared.arenas.free_subtree(task.node);
            freed.blocks += f.blocks;
            freed.sparsity_leaves += f.sparsity_leaves;
            freed.lod_runs += f.lod_runs;
        }
        self.shared.counters.take();
        self.run(tasks)?;
        self.rebuild_observer = self.last_observer;

        let (interior, sparse, lod) = self.shared.counters.take();
        log::info!(
            "Rebuilt {} stale nodes in {:.1}ms: freed {} blocks/{} sparse/{} runs, built {}/{}/{}",
            count,
            start.elapsed().as_secs_f64() * 1000.0,
            freed.blocks,
            freed.sparsity_leaves,
            freed.lod_runs,
            interior,
            sparse,
            lod
        );

        if let Some(buffers) = &mut self.buffers {
            let synced = buffers.sync(&self.shared.arenas)?;
            log::debug!("Synced after rebuild: {:?}", synced);
        }
        Ok(count)
    }

    /// Mirror the arenas into GPU storage buffers. Later builds and rebuilds
    /// keep them up to date.
    pub fn attach_gpu(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<()> {
        let mut buffers = TreeBuffers::new(device, queue);
        buffers.upload_full(&self.shared.arenas)?;
        if let Some(mut old) = self.buffers.replace(buffers) {
            old.destroy();
        }
        Ok(())
    }

    /// Node storage buffer (binding 3), once a GPU is attached
    pub fn node_buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffers.as_ref().and_then(|b| b.node_buffer())
    }

    /// Leaf storage buffer (binding 4), once a GPU is attached
    pub fn leaf_buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffers.as_ref().and_then(|b| b.leaf_buffer())
    }

    pub fn gpu_buffers(&self) -> Option<&TreeBuffers> {
        self.buffers.as_ref()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            nodes: self.shared.arenas.nodes.snapshot(),
            leaves: self.shared.arenas.leaves.snapshot(),
            root_center: ROOT_CENTER,
        }
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats::collect(&self.snapshot(), &self.shared.config)
    }

    pub fn validate(&self) -> ValidationReport {
        validate::validate(&self.snapshot(), &self.shared.config)
    }

    pub fn config(&self) -> &TreeConfig {
        &self.shared.config
    }

    pub fn sampler(&self) -> &dyn FieldSampler {
        self.shared.sampler.as_ref()
    }

    pub fn arenas(&self) -> &Arenas {
        &self.shared.arenas
    }

    pub fn observer(&self) -> Vec3 {
        self.last_observer
    }

    pub fn rebuild_observer(&self) -> Vec3 {
        self.rebuild_observer
    }

    /// Stale nodes queued and not yet rebuilt
    pub fn pending_stale(&self) -> usize {
        self.stale.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Stop the workers and release the GPU buffers. Safe to call twice.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.shared.work.close();
        self.stale.close();
        let workers = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Builder worker panicked");
            }
        }
        if let Some(mut buffers) = self.buffers.take() {
            buffers.destroy();
        }
        log::info!("Tree destroyed, {} workers joined", workers);
    }

    /// Hand `tasks` to the workers and wait for them and all their
    /// descendants to finish.
    fn run(&self, tasks: Vec<Task>) -> Result<()> {
        let shared = &self.shared;
        shared.wait_group.add(tasks.len());
        let mut pending = tasks.len();
        for task in tasks {
            if let Err(e) = shared.work.send(task) {
                // Unsent tasks will never be completed
                for _ in 0..pending {
                    shared.wait_group.done();
                }
                return Err(e);
            }
            pending -= 1;
        }
        shared.wait_group.wait();
        match shared.failure.lock().unwrap().take() {
            Some(message) => Err(Error::Sampler(message)),
            None => Ok(()),
        }
    }

    fn free_root_children(&self) -> FreedCounts {
        let mut freed = FreedCounts::default();
        for i in 0..BLOCK_SIZE {
            let f = self.shared.arenas.free_subtree(self.root_block + i);
            freed.blocks += f.blocks;
            freed.sparsity_leaves += f.sparsity_leaves;
            freed.lod_runs += f.lod_runs;
        }
        freed
    }

    fn set_observer(&mut self, observer: Vec3) {
        self.last_observer = observer;
        *self.shared.observer.write().unwrap() = observer;
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::bound::HALF_DIAGONAL;
    use crate::render::context::HeadlessContext;

    fn floor_config() -> TreeConfig {
        TreeConfig {
            max_depth: 3,
            base_voxel_size: 1.0,
            worker_count: Some(4),
            channel_capacity: 64,
            ..Default::default()
        }
    }

    fn floor(p: Vec3) -> f32 {
        p.y + 2.0
    }

    /// Visit every reachable leaf node as (node, depth, center).
    fn leaf_nodes(snapshot: &TreeSnapshot, config: &TreeConfig) -> Vec<(Node, u32, Vec3)> {
        let mut out = Vec::new();
        let mut stack = vec![(ROOT_INDEX, 0u32, snapshot.root_center)];
        while let Some((index, depth, center)) = stack.pop() {
            let node = snapshot.nodes[index as usize];
            if node.is_leaf() {
                out.push((node, depth, center));
            } else if node.is_interior() {
                let edge = config.edge_at(depth + 1);
                for i in 0..BLOCK_SIZE {
                    stack.push((node.index() + i, depth + 1, child_center(i, edge, center)));
                }
            }
        }
        out
    }

    #[test]
    fn test_floor_build() {
        let config = floor_config();
        let mut tree = Tree::new(config.clone(), floor).unwrap();
        tree.build(Vec3::ZERO).unwrap();

        let report = tree.validate();
        assert!(report.is_valid(), "{:?}", report.errors);
        assert_eq!(report.unset, 0);

        let snapshot = tree.snapshot();
        assert_eq!(snapshot.nodes[0].index(), 64);
        assert!(snapshot.nodes[0].is_interior());
        assert!((64..128).all(|i| !snapshot.nodes[i].is_unset()));

        let mut lod_leaves = 0;
        for (node, depth, center) in leaf_nodes(&snapshot, &config) {
            let edge = config.edge_at(depth);
            let leaf = snapshot.leaves[node.index() as usize];
            if leaf.is_lod() {
                lod_leaves += 1;
                assert!((center.y + 2.0).abs() < edge * 2.0 * HALF_DIAGONAL);
            } else {
                assert_eq!(leaf.distance < 0.0, floor(center) < 0.0);
                assert!(leaf.distance.abs() >= edge * HALF_DIAGONAL - edge * config.surface_epsilon - 1e-4);
            }
        }
        assert!(lod_leaves > 0);
        assert_eq!(tree.stats().lod_leaves(), lod_leaves);
    }

    #[test]
    fn test_sphere_build() {
        let config = TreeConfig {
            max_depth: 4,
            base_voxel_size: 0.5,
            worker_count: Some(4),
            ..Default::default()
        };
        let sphere = |p: Vec3| p.length() - 5.0;
        let mut tree = Tree::new(config.clone(), sphere).unwrap();
        tree.build(Vec3::ZERO).unwrap();
        assert!(tree.validate().is_valid());

        let snapshot = tree.snapshot();
        let mut lod_leaves = 0;
        for (node, depth, center) in leaf_nodes(&snapshot, &config) {
            let leaf = snapshot.leaves[node.index() as usize];
            let r = center.length();
            if leaf.is_lod() {
                lod_leaves += 1;
                // Shell around the surface
                assert!((r - 5.0).abs() < config.edge_at(depth) * 2.0 * HALF_DIAGONAL);
            } else if r > 5.0 + config.edge_at(depth) {
                assert!(leaf.distance > 0.0);
            }
        }
        assert!(lod_leaves > 0);
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = {
            let mut tree = Tree::new(floor_config(), floor).unwrap();
            tree.build(Vec3::ZERO).unwrap();
            tree.stats()
        };
        let b = {
            let mut tree = Tree::new(floor_config(), floor).unwrap();
            tree.build(Vec3::ZERO).unwrap();
            tree.stats()
        };
        assert_eq!(a.levels, b.levels);
        assert_eq!(a.histogram, b.histogram);
    }

    #[test]
    fn test_rebuild_reuses_arenas() {
        let mut tree = Tree::new(floor_config(), floor).unwrap();
        tree.build(Vec3::ZERO).unwrap();
        let nodes = tree.arenas().nodes.len();
        let leaves = tree.arenas().leaves.len();
        tree.build(Vec3::ZERO).unwrap();
        assert_eq!(tree.arenas().nodes.len(), nodes);
        assert_eq!(tree.arenas().leaves.len(), leaves);
        assert!(tree.validate().is_valid());
    }

    #[test]
    fn test_small_move_is_noop() {
        let mut tree = Tree::new(floor_config(), floor).unwrap();
        tree.build(Vec3::ZERO).unwrap();
        let before = tree.snapshot();
        assert_eq!(tree.move_observer(Vec3::new(5.0, 0.0, 0.0)), 0);
        assert_eq!(tree.pending_stale(), 0);
        assert_eq!(tree.observer(), Vec3::ZERO);
        assert_eq!(tree.update_stale_lods().unwrap(), 0);
        let after = tree.snapshot();
        assert_eq!(after.nodes, before.nodes);
        assert_eq!(after.leaves, before.leaves);
    }

    #[test]
    fn test_observer_motion_rebuilds_stale_nodes() {
        crate::core::logging::try_init();
        let config = TreeConfig {
            lod_threshold: 64.0,
            min_lod_depth: 1,
            ..floor_config()
        };
        let mut tree = Tree::new(config, floor).unwrap();
        tree.build(Vec3::ZERO).unwrap();
        let nodes = tree.arenas().nodes.len();
        let leaves = tree.arenas().leaves.len();
        let fine = tree.stats();

        // Far away the schedule stops one level higher
        let queued = tree.move_observer(Vec3::new(0.0, 0.0, 200.0));
        assert!(queued >= 1);
        assert_eq!(tree.pending_stale(), queued);
        assert_eq!(tree.update_stale_lods().unwrap(), queued);
        assert_eq!(tree.pending_stale(), 0);
        assert_eq!(tree.rebuild_observer(), Vec3::new(0.0, 0.0, 200.0));
        let report = tree.validate();
        assert!(report.is_valid(), "{:?}", report.errors);
        let coarse = tree.stats();
        assert!(coarse.levels[1].lod_leaves > 0);
        assert!(coarse.lod_leaves() < fine.lod_leaves());

        // Coming back restores full detail from the free lists
        assert!(tree.move_observer(Vec3::ZERO) >= 1);
        tree.update_stale_lods().unwrap();
        assert!(tree.validate().is_valid());
        assert_eq!(tree.stats().levels, fine.levels);
        assert!(tree.arenas().nodes.len() <= nodes);
        assert!(tree.arenas().leaves.len() <= leaves);
    }

    #[test]
    fn test_destroy_twice() {
        let mut tree = Tree::new(floor_config(), floor).unwrap();
        tree.build(Vec3::ZERO).unwrap();
        tree.destroy();
        assert!(tree.is_destroyed());
        assert_eq!(tree.worker_count(), 0);
        tree.destroy();
        assert!(matches!(tree.build(Vec3::ZERO), Err(Error::Closed)));
        assert!(matches!(tree.update_stale_lods(), Err(Error::Closed)));
        assert_eq!(tree.move_observer(Vec3::splat(100.0)), 0);
    }

    #[test]
    fn test_sampler_panic_fails_build() {
        crate::core::logging::try_init();
        let faulty = |p: Vec3| {
            if p.cmpgt(Vec3::splat(20.0)).all() {
                panic!("sample outside terrain");
            }
            floor(p)
        };
        let mut tree = Tree::new(floor_config(), faulty).unwrap();
        match tree.build(Vec3::ZERO) {
            Err(Error::Sampler(message)) => assert!(message.contains("outside terrain")),
            other => panic!("expected sampler error, got {:?}", other),
        }
        // Workers survive and the failed node is left unset
        assert_eq!(tree.worker_count(), 4);
        assert!(tree.validate().unset > 0);

        tree.destroy();
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let config = TreeConfig { max_depth: 0, ..floor_config() };
        let mut tree = Tree::new(config, floor).unwrap();
        assert!(matches!(tree.build(Vec3::ZERO), Err(Error::Config(_))));
    }

    #[test]
    fn test_gpu_mirror_tracks_rebuilds() {
        let Some(ctx) = HeadlessContext::for_tests() else { return };
        let config = TreeConfig {
            lod_threshold: 64.0,
            min_lod_depth: 1,
            ..floor_config()
        };
        let mut tree = Tree::new(config, floor).unwrap();
        tree.attach_gpu(&ctx.device, &ctx.queue).unwrap();
        tree.build(Vec3::ZERO).unwrap();
        assert!(tree.node_buffer().is_some());
        assert!(tree.leaf_buffer().is_some());

        tree.move_observer(Vec3::new(0.0, 0.0, 200.0));
        tree.update_stale_lods().unwrap();
        let snapshot = tree.snapshot();
        let buffers = tree.gpu_buffers().unwrap();
        assert_eq!(buffers.node_mirror().read_back().unwrap(), snapshot.nodes);
        assert_eq!(buffers.leaf_mirror().read_back().unwrap(), snapshot.leaves);

        tree.destroy();
        assert!(tree.node_buffer().is_none());
    }
}
