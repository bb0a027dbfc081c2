//! Parallel subdivision workers
//!
//! Each worker pulls a [`Task`] from the shared work channel and applies the
//! termination rule to that node:
//!
//! 1. the center sample bounds the whole cube away from the surface: emit a
//!    sparsity leaf;
//! 2. the node is as deep as the LOD schedule allows: emit a 64-voxel LOD leaf;
//! 3. otherwise allocate a child block, publish it, and enqueue the children.
//!
//! Workers are producers too, so they never block on a full channel. Children
//! that do not fit go onto a private stack that the worker drains before it
//! receives again.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::TrySendError;
use glam::Vec3;

use super::arena::Arenas;
use super::geometry::child_center;
use super::lod::LodPolicy;
use super::node::{BLOCK_SIZE, LEAF_FLAG, Leaf};
use crate::core::config::TreeConfig;
use crate::field::FieldSampler;
use crate::field::bound::{bound, is_sparse};
use crate::sync::{WaitGroup, WorkChannel};

/// A node waiting to be subdivided.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Task {
    /// Node arena index
    pub node: u32,
    /// Depth of the node; the root is 0
    pub depth: u32,
    /// World-space center of the node
    pub center: Vec3,
}

/// Counts of records produced since the last reset.
#[derive(Default)]
pub struct BuildCounters {
    pub interior: AtomicUsize,
    pub sparsity_leaves: AtomicUsize,
    pub lod_leaves: AtomicUsize,
}

impl BuildCounters {
    /// Return (interior, sparsity, lod) and zero the counters.
    pub fn take(&self) -> (usize, usize, usize) {
        (
            self.interior.swap(0, Ordering::Relaxed),
            self.sparsity_leaves.swap(0, Ordering::Relaxed),
            self.lod_leaves.swap(0, Ordering::Relaxed),
        )
    }
}

/// State shared between the control thread and the workers.
pub struct Shared {
    pub config: TreeConfig,
    pub lod: LodPolicy,
    pub sampler: Box<dyn FieldSampler>,
    pub arenas: Arenas,
    pub work: WorkChannel<Task>,
    pub wait_group: WaitGroup,
    /// Observer the current generation builds against. Written only by the
    /// control thread while no generation is running.
    pub observer: RwLock<Vec3>,
    pub counters: BuildCounters,
    /// First sampler panic since the control thread last checked
    pub failure: Mutex<Option<String>>,
}

impl Shared {
    pub fn new(config: TreeConfig, sampler: Box<dyn FieldSampler>) -> Self {
        Self {
            lod: LodPolicy::from_config(&config),
            work: WorkChannel::new(config.channel_capacity),
            config,
            sampler,
            arenas: Arenas::new(),
            wait_group: WaitGroup::new(),
            observer: RwLock::new(Vec3::ZERO),
            counters: BuildCounters::default(),
            failure: Mutex::new(None),
        }
    }
}

/// Worker body: runs until the work channel is closed and drained.
pub fn worker_loop(shared: &Shared, id: usize) {
    log::debug!("Builder worker {} started", id);
    let mut overflow: Vec<Task> = Vec::new();
    let mut processed = 0usize;
    loop {
        let task = match overflow.pop() {
            Some(task) => task,
            None => match shared.work.receive() {
                Ok(task) => task,
                Err(_) => break,
            },
        };
        // A panicking sampler leaves the node unset; the task still counts as
        // done so the control thread wakes up and reports the failure.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subdivide(shared, task, &mut overflow))) {
            let message = panic_message(payload.as_ref());
            log::error!("Builder worker {} panicked at node {}: {}", id, task.node, message);
            shared.failure.lock().unwrap().get_or_insert(message);
        }
        shared.wait_group.done();
        processed += 1;
    }
    log::debug!("Builder worker {} stopped after {} tasks", id, processed);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Apply the termination rule to one node.
pub fn subdivide(shared: &Shared, task: Task, overflow: &mut Vec<Task>) {
    let config = &shared.config;
    let eps = config.surface_epsilon;
    let edge = config.edge_at(task.depth);
    let child_edge = edge * 0.25;
    let nodes = &shared.arenas.nodes;
    let leaves = &shared.arenas.leaves;

    let distance = bound(shared.sampler.sample(task.center), edge, eps);
    if is_sparse(distance, edge, eps) {
        let leaf = leaves.alloc_leaf(Leaf::sparsity(distance));
        nodes.set(task.node, leaf | LEAF_FLAG, 0);
        shared.counters.sparsity_leaves.fetch_add(1, Ordering::Relaxed);
        log::trace!("sparsity leaf at node {} depth {} d={:.3}", task.node, task.depth, distance);
        return;
    }

    let observer = *shared.observer.read().unwrap();
    if task.depth >= config.max_depth || shared.lod.is_lod_leaf_depth(task.depth, task.center, observer) {
        let mut voxels = [Leaf::EMPTY; BLOCK_SIZE as usize];
        let mut mask = 0u64;
        for (i, voxel) in voxels.iter_mut().enumerate() {
            let c = child_center(i as u32, child_edge, task.center);
            let d = bound(shared.sampler.sample(c), child_edge, eps);
            if d < 0.0 {
                mask |= 1 << i;
            }
            *voxel = Leaf::voxel(d);
        }
        let first = leaves.alloc_run();
        leaves.write_run(first, &voxels);
        nodes.set(task.node, first | LEAF_FLAG, mask);
        shared.counters.lod_leaves.fetch_add(1, Ordering::Relaxed);
        log::trace!("lod leaf at node {} depth {} mask={:016x}", task.node, task.depth, mask);
        return;
    }

    // Freshly allocated blocks are zeroed, so publishing before the children
    // are processed is safe: readers see unset nodes.
    let block = nodes.alloc_block();
    nodes.set(task.node, block, 0);
    shared.counters.interior.fetch_add(1, Ordering::Relaxed);

    shared.wait_group.add(BLOCK_SIZE as usize);
    for i in 0..BLOCK_SIZE {
        let child = Task {
            node: block + i,
            depth: task.depth + 1,
            center: child_center(i, child_edge, task.center),
        };
        match shared.work.try_send(child) {
            Ok(()) => {}
            Err(TrySendError::Full(child)) => overflow.push(child),
            // Shutting down: abandon the child, it stays unset
            Err(TrySendError::Disconnected(_)) => shared.wait_group.done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::Material;

    fn shared_with(config: TreeConfig, field: impl FieldSampler + 'static) -> Shared {
        Shared::new(config, Box::new(field))
    }

    fn small_config() -> TreeConfig {
        TreeConfig {
            max_depth: 3,
            base_voxel_size: 1.0,
            lod_threshold: 64.0,
            channel_capacity: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_far_node_becomes_sparsity_leaf() {
        let shared = shared_with(small_config(), |p: Vec3| p.y + 2.0);
        let block = shared.arenas.nodes.alloc_block();
        let mut overflow = Vec::new();
        // depth 2 has edge 4; center 20 above the floor
        let task = Task { node: block, depth: 2, center: Vec3::new(0.0, 18.0, 0.0) };
        subdivide(&shared, task, &mut overflow);

        let node = shared.arenas.nodes.get(block);
        assert!(node.is_leaf());
        let leaf = shared.arenas.leaves.get(node.index());
        assert!(!leaf.is_lod());
        assert!((leaf.distance - (20.0 - 4.0 * 0.866_025_4)).abs() < 1e-4);
        assert_eq!(leaf.material(), Material::Air);
        assert!(overflow.is_empty());
    }

    #[test]
    fn test_surface_node_at_lod_depth_becomes_lod_leaf() {
        let shared = shared_with(small_config(), |p: Vec3| p.y + 2.0);
        let block = shared.arenas.nodes.alloc_block();
        let mut overflow = Vec::new();
        // depth 2, edge 4, voxels of edge 1 at y = -3.5, -2.5, -1.5, -0.5
        let task = Task { node: block, depth: 2, center: Vec3::new(0.0, -2.0, 0.0) };
        subdivide(&shared, task, &mut overflow);

        let node = shared.arenas.nodes.get(block);
        assert!(node.is_leaf());
        let first = node.index();
        let mut expected_mask = 0u64;
        for i in 0..64u32 {
            let leaf = shared.arenas.leaves.get(first + i);
            assert!(leaf.is_lod());
            if leaf.distance < 0.0 {
                expected_mask |= 1 << i;
                assert_eq!(leaf.material(), Material::Grass);
            }
        }
        assert_eq!(node.child_mask(), expected_mask);
        // Two lowest voxel layers (y = -3.5, -2.5) are solid
        assert_eq!(expected_mask.count_ones(), 32);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("bad sample {}", 3)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "bad sample 3");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn test_near_node_subdivides_and_overflows() {
        let shared = shared_with(small_config(), |p: Vec3| p.y + 2.0);
        let block = shared.arenas.nodes.alloc_block();
        let mut overflow = Vec::new();
        // depth 1, edge 16: not sparse near the floor and too shallow for LOD
        let task = Task { node: block, depth: 1, center: Vec3::new(8.0, -8.0, 8.0) };
        shared.wait_group.add(1);
        subdivide(&shared, task, &mut overflow);
        shared.wait_group.done();

        let node = shared.arenas.nodes.get(block);
        assert!(node.is_interior());
        assert_eq!(node.index() % 64, 0);
        // Channel capacity 8: the rest spilled to the local stack
        assert_eq!(shared.work.len(), 8);
        assert_eq!(overflow.len(), 56);
        assert_eq!(shared.wait_group.count(), 64);
        let queued = shared.work.drain();
        assert!(queued.iter().chain(overflow.iter()).all(|t| t.depth == 2));
    }
}
