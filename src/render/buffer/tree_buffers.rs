//! Node and leaf storage buffers mirrored from the tree arenas

use std::ops::Range;

use bytemuck::Pod;

use super::mirrored::MirroredBuffer;
use crate::core::error::Error;
use crate::tree::arena::Arenas;
use crate::tree::node::{Leaf, Node};

/// Binding of the node buffer in set 0
pub const NODE_BINDING: u32 = 3;
/// Binding of the leaf buffer in set 0
pub const LEAF_BINDING: u32 = 4;

/// Bytes uploaded by one [`TreeBuffers::sync`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub node_bytes: u64,
    pub leaf_bytes: u64,
    pub resized: bool,
}

/// The two storage buffers a ray-marching shader reads.
pub struct TreeBuffers {
    nodes: MirroredBuffer<Node>,
    leaves: MirroredBuffer<Leaf>,
}

impl TreeBuffers {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        Self {
            nodes: MirroredBuffer::new(device, queue, "sdo_nodes"),
            leaves: MirroredBuffer::new(device, queue, "sdo_leaves"),
        }
    }

    /// Replace both buffers with a full copy of the arenas.
    pub fn upload_full(&mut self, arenas: &Arenas) -> Result<(), Error> {
        // Clear dirty state first so nothing written after the copy is lost
        arenas.nodes.take_dirty();
        arenas.leaves.take_dirty();
        let nodes = arenas.nodes.snapshot();
        let leaves = arenas.leaves.snapshot();
        self.nodes.create(&nodes)?;
        self.leaves.create(&leaves)?;
        log::info!(
            "Uploaded tree: {} nodes ({} KB), {} leaves ({} KB)",
            nodes.len(),
            nodes.len() * std::mem::size_of::<Node>() / 1024,
            leaves.len(),
            leaves.len() * std::mem::size_of::<Leaf>() / 1024
        );
        Ok(())
    }

    /// Upload everything the arenas changed since the last upload or sync.
    pub fn sync(&mut self, arenas: &Arenas) -> Result<SyncStats, Error> {
        let node_dirty = arenas.nodes.take_dirty();
        let leaf_dirty = arenas.leaves.take_dirty();
        let (node_bytes, nodes_resized) =
            sync_mirror(&mut self.nodes, arenas.nodes.len(), node_dirty, |r| arenas.nodes.copy_range(r))?;
        let (leaf_bytes, leaves_resized) =
            sync_mirror(&mut self.leaves, arenas.leaves.len(), leaf_dirty, |r| arenas.leaves.copy_range(r))?;
        let stats = SyncStats {
            node_bytes,
            leaf_bytes,
            resized: nodes_resized || leaves_resized,
        };
        log::debug!(
            "Synced tree buffers: {} KB nodes, {} KB leaves{}",
            node_bytes / 1024,
            leaf_bytes / 1024,
            if stats.resized { " (resized)" } else { "" }
        );
        Ok(stats)
    }

    pub fn node_buffer(&self) -> Option<&wgpu::Buffer> {
        self.nodes.buffer()
    }

    pub fn leaf_buffer(&self) -> Option<&wgpu::Buffer> {
        self.leaves.buffer()
    }

    pub fn node_mirror(&self) -> &MirroredBuffer<Node> {
        &self.nodes
    }

    pub fn leaf_mirror(&self) -> &MirroredBuffer<Leaf> {
        &self.leaves
    }

    /// Layout entries for bindings 3 (nodes) and 4 (leaves), read-only storage.
    pub fn bind_group_layout_entries(visibility: wgpu::ShaderStages) -> [wgpu::BindGroupLayoutEntry; 2] {
        let storage = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        [storage(NODE_BINDING), storage(LEAF_BINDING)]
    }

    /// Bind group entries matching [`Self::bind_group_layout_entries`], once uploaded.
    pub fn bind_group_entries(&self) -> Option<[wgpu::BindGroupEntry<'_>; 2]> {
        let nodes = self.nodes.buffer()?;
        let leaves = self.leaves.buffer()?;
        Some([
            wgpu::BindGroupEntry {
                binding: NODE_BINDING,
                resource: nodes.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: LEAF_BINDING,
                resource: leaves.as_entire_binding(),
            },
        ])
    }

    pub fn destroy(&mut self) {
        self.nodes.destroy();
        self.leaves.destroy();
    }
}

/// Bring one mirror up to date with an arena of `len` records.
///
/// A mirror that is too small doubles (or jumps to `len`) and receives the
/// whole arena; otherwise only dirty ranges are written.
fn sync_mirror<T: Pod>(
    mirror: &mut MirroredBuffer<T>,
    len: usize,
    dirty: Vec<Range<usize>>,
    copy: impl Fn(Range<usize>) -> Vec<T>,
) -> Result<(u64, bool), Error> {
    let element = std::mem::size_of::<T>() as u64;
    if len > mirror.capacity() {
        let new_capacity = len.max(mirror.capacity() * 2);
        mirror.resize(new_capacity)?;
        mirror.update_range(0, &copy(0..len))?;
        return Ok((len as u64 * element, true));
    }
    let mut bytes = 0;
    for range in dirty {
        let start = range.start;
        let records = copy(range);
        bytes += records.len() as u64 * element;
        mirror.update_range(start, &records)?;
    }
    Ok((bytes, false))
}
