//! Shared node and leaf arenas
//!
//! Both arenas are append-only vectors of atomic slots behind an `RwLock`.
//! Readers and in-place writers take the read lock; only growth takes the
//! write lock, so a published index stays valid across a resize. Allocation
//! and freeing serialize on a per-arena mutex that also guards the free
//! lists.
//!
//! Node blocks are 64 contiguous slots and only the first index of a freed
//! block is kept on the free list. Leaves come in two shapes: single
//! sparsity leaves and 64-leaf LOD runs, each with its own free list.
//!
//! Every mutation marks the 64-slot chunk it touched as dirty so the GPU
//! mirror can upload just those ranges.

#[cfg(debug_assertions)]
use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use super::node::{BLOCK_SIZE, INDEX_MASK, LEAF_FLAG, Leaf, Node};

const CHUNK: usize = BLOCK_SIZE as usize;

/// Node slot with atomically published child pointer
#[derive(Default)]
struct NodeSlot {
    child_pointer: AtomicU32,
    child_mask: AtomicU64,
}

/// Per-chunk dirty flags, grown alongside the slots they cover.
#[derive(Default)]
struct DirtyChunks {
    flags: Vec<AtomicBool>,
}

impl DirtyChunks {
    fn cover(&mut self, len: usize) {
        let chunks = len.div_ceil(CHUNK);
        while self.flags.len() < chunks {
            self.flags.push(AtomicBool::new(true));
        }
    }

    #[inline]
    fn mark(&self, index: usize) {
        if let Some(flag) = self.flags.get(index / CHUNK) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Clear all flags, returning coalesced element ranges bounded by `len`.
    fn take(&self, len: usize) -> Vec<Range<usize>> {
        let mut ranges: Vec<Range<usize>> = Vec::new();
        for (chunk, flag) in self.flags.iter().enumerate() {
            if !flag.swap(false, Ordering::Relaxed) {
                continue;
            }
            let start = chunk * CHUNK;
            let end = (start + CHUNK).min(len);
            if start >= end {
                continue;
            }
            match ranges.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => ranges.push(start..end),
            }
        }
        ranges
    }
}

/// LIFO free list. Debug builds also track membership to catch double frees.
#[derive(Default)]
struct FreeList {
    items: Vec<u32>,
    #[cfg(debug_assertions)]
    members: HashSet<u32>,
}

impl FreeList {
    fn push(&mut self, index: u32, kind: &str) {
        #[cfg(debug_assertions)]
        assert!(self.members.insert(index), "double free of {kind} {index}");
        #[cfg(not(debug_assertions))]
        let _ = kind;
        self.items.push(index);
    }

    fn pop(&mut self) -> Option<u32> {
        let index = self.items.pop()?;
        #[cfg(debug_assertions)]
        self.members.remove(&index);
        Some(index)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

struct NodeStorage {
    slots: Vec<NodeSlot>,
    dirty: DirtyChunks,
}

/// Arena of node records, allocated in 64-blocks.
pub struct NodeArena {
    storage: RwLock<NodeStorage>,
    /// Heads of freed blocks
    free_blocks: Mutex<FreeList>,
}

impl NodeArena {
    /// Create an arena holding block 0: the root at index 0 and 63 reserved slots.
    pub fn new() -> Self {
        let mut storage = NodeStorage { slots: Vec::new(), dirty: DirtyChunks::default() };
        storage.slots.resize_with(CHUNK, NodeSlot::default);
        storage.dirty.cover(CHUNK);
        Self {
            storage: RwLock::new(storage),
            free_blocks: Mutex::new(FreeList::default()),
        }
    }

    /// Reserve 64 contiguous zeroed slots and return the first index.
    pub fn alloc_block(&self) -> u32 {
        let mut free = self.free_blocks.lock().unwrap();
        if let Some(head) = free.pop() {
            debug_assert!(self.block_is_zero(head), "free block {head} was not zeroed");
            self.storage.read().unwrap().dirty.mark(head as usize);
            return head;
        }
        let mut storage = self.storage.write().unwrap();
        let head = storage.slots.len();
        assert!(head + CHUNK <= INDEX_MASK as usize, "node arena exhausted the 31-bit index space");
        storage.slots.resize_with(head + CHUNK, NodeSlot::default);
        storage.dirty.cover(head + CHUNK);
        head as u32
    }

    /// Zero a block and return it to the free list.
    pub fn free_block(&self, head: u32) {
        debug_assert!(head % BLOCK_SIZE == 0, "freeing non-block-head {head}");
        debug_assert!(head != 0, "block 0 holds the root and is never freed");
        let mut free = self.free_blocks.lock().unwrap();
        {
            let storage = self.storage.read().unwrap();
            debug_assert!((head as usize) + CHUNK <= storage.slots.len());
            for slot in &storage.slots[head as usize..head as usize + CHUNK] {
                slot.child_mask.store(0, Ordering::Relaxed);
                slot.child_pointer.store(0, Ordering::Release);
            }
            storage.dirty.mark(head as usize);
        }
        free.push(head, "block");
    }

    /// Load a node record. The child pointer is read with acquire ordering.
    pub fn get(&self, index: u32) -> Node {
        let storage = self.storage.read().unwrap();
        let slot = &storage.slots[index as usize];
        let child_pointer = slot.child_pointer.load(Ordering::Acquire);
        Node::new(child_pointer, slot.child_mask.load(Ordering::Relaxed))
    }

    pub fn child_pointer(&self, index: u32) -> u32 {
        self.storage.read().unwrap().slots[index as usize]
            .child_pointer
            .load(Ordering::Acquire)
    }

    /// Publish a node: the mask first, then the pointer with release ordering.
    pub fn set(&self, index: u32, child_pointer: u32, child_mask: u64) {
        debug_assert!(
            child_pointer & LEAF_FLAG != 0 || child_pointer % BLOCK_SIZE == 0,
            "child pointer {child_pointer} is not block aligned"
        );
        let storage = self.storage.read().unwrap();
        let slot = &storage.slots[index as usize];
        slot.child_mask.store(child_mask, Ordering::Relaxed);
        slot.child_pointer.store(child_pointer, Ordering::Release);
        storage.dirty.mark(index as usize);
    }

    /// Reset a node to the unset state without freeing anything under it.
    pub fn clear(&self, index: u32) {
        self.set(index, 0, 0);
    }

    pub fn len(&self) -> usize {
        self.storage.read().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of freed blocks waiting for reuse.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.lock().unwrap().len()
    }

    /// Copy records in `range` out as GPU records.
    pub fn copy_range(&self, range: Range<usize>) -> Vec<Node> {
        let storage = self.storage.read().unwrap();
        storage.slots[range]
            .iter()
            .map(|slot| {
                let child_pointer = slot.child_pointer.load(Ordering::Acquire);
                Node::new(child_pointer, slot.child_mask.load(Ordering::Relaxed))
            })
            .collect()
    }

    /// Copy the whole arena.
    pub fn snapshot(&self) -> Vec<Node> {
        let len = self.len();
        self.copy_range(0..len)
    }

    /// Take and clear the dirty ranges since the last call.
    pub fn take_dirty(&self) -> Vec<Range<usize>> {
        let storage = self.storage.read().unwrap();
        storage.dirty.take(storage.slots.len())
    }

    fn block_is_zero(&self, head: u32) -> bool {
        let storage = self.storage.read().unwrap();
        storage.slots[head as usize..head as usize + CHUNK].iter().all(|slot| {
            slot.child_pointer.load(Ordering::Relaxed) == 0 && slot.child_mask.load(Ordering::Relaxed) == 0
        })
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

struct LeafStorage {
    /// `Leaf` records bit-cast to u64
    slots: Vec<AtomicU64>,
    dirty: DirtyChunks,
}

#[derive(Default)]
struct LeafFreeLists {
    singles: FreeList,
    runs: FreeList,
}

/// Arena of leaf records.
pub struct LeafArena {
    storage: RwLock<LeafStorage>,
    free: Mutex<LeafFreeLists>,
}

impl LeafArena {
    pub fn new() -> Self {
        Self {
            storage: RwLock::new(LeafStorage { slots: Vec::new(), dirty: DirtyChunks::default() }),
            free: Mutex::new(LeafFreeLists::default()),
        }
    }

    /// Store a single leaf, reusing a freed slot when one exists.
    ///
    /// With no free single left, a freed run is split into 64 singles before
    /// the arena grows.
    pub fn alloc_leaf(&self, leaf: Leaf) -> u32 {
        let mut free = self.free.lock().unwrap();
        if let Some(index) = free.singles.pop() {
            self.set(index, leaf);
            return index;
        }
        if let Some(first) = free.runs.pop() {
            for i in (first + 1..first + BLOCK_SIZE).rev() {
                free.singles.push(i, "leaf");
            }
            self.set(first, leaf);
            return first;
        }
        let index = self.grow(1);
        self.set(index, leaf);
        index
    }

    /// Reserve 64 consecutive zeroed leaves for a LOD run.
    pub fn alloc_run(&self) -> u32 {
        let mut free = self.free.lock().unwrap();
        if let Some(first) = free.runs.pop() {
            return first;
        }
        self.grow(CHUNK)
    }

    pub fn free_leaf(&self, index: u32) {
        let mut free = self.free.lock().unwrap();
        self.set(index, Leaf::EMPTY);
        free.singles.push(index, "leaf");
    }

    pub fn free_run(&self, first: u32) {
        let mut free = self.free.lock().unwrap();
        {
            let storage = self.storage.read().unwrap();
            debug_assert!(first as usize + CHUNK <= storage.slots.len());
            for i in first as usize..first as usize + CHUNK {
                storage.slots[i].store(0, Ordering::Relaxed);
                storage.dirty.mark(i);
            }
        }
        free.runs.push(first, "leaf run");
    }

    pub fn get(&self, index: u32) -> Leaf {
        let storage = self.storage.read().unwrap();
        Leaf::from_bits(storage.slots[index as usize].load(Ordering::Acquire))
    }

    pub fn set(&self, index: u32, leaf: Leaf) {
        let storage = self.storage.read().unwrap();
        storage.slots[index as usize].store(leaf.to_bits(), Ordering::Release);
        storage.dirty.mark(index as usize);
    }

    /// Write consecutive leaves starting at `first` under one lock.
    pub fn write_run(&self, first: u32, leaves: &[Leaf]) {
        let storage = self.storage.read().unwrap();
        for (i, leaf) in leaves.iter().enumerate() {
            let index = first as usize + i;
            storage.slots[index].store(leaf.to_bits(), Ordering::Release);
            storage.dirty.mark(index);
        }
    }

    pub fn len(&self) -> usize {
        self.storage.read().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freed (single, run) entries waiting for reuse.
    pub fn free_counts(&self) -> (usize, usize) {
        let free = self.free.lock().unwrap();
        (free.singles.len(), free.runs.len())
    }

    pub fn copy_range(&self, range: Range<usize>) -> Vec<Leaf> {
        let storage = self.storage.read().unwrap();
        storage.slots[range]
            .iter()
            .map(|bits| Leaf::from_bits(bits.load(Ordering::Acquire)))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Leaf> {
        let len = self.len();
        self.copy_range(0..len)
    }

    pub fn take_dirty(&self) -> Vec<Range<usize>> {
        let storage = self.storage.read().unwrap();
        storage.dirty.take(storage.slots.len())
    }

    fn grow(&self, count: usize) -> u32 {
        let mut storage = self.storage.write().unwrap();
        let first = storage.slots.len();
        assert!(first + count <= INDEX_MASK as usize, "leaf arena exhausted the 31-bit index space");
        storage.slots.resize_with(first + count, || AtomicU64::new(0));
        storage.dirty.cover(first + count);
        first as u32
    }
}

impl Default for LeafArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Records released by one [`Arenas::free_subtree`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreedCounts {
    pub blocks: usize,
    pub sparsity_leaves: usize,
    pub lod_runs: usize,
}

/// The two arenas of a tree.
#[derive(Default)]
pub struct Arenas {
    pub nodes: NodeArena,
    pub leaves: LeafArena,
}

impl Arenas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Free every block and leaf below `root`, keeping `root` itself as an
    /// unset node ready for rebuild.
    ///
    /// Iterative; all child pointers are read before any block is zeroed.
    /// Must not run concurrently with a build touching the same subtree.
    pub fn free_subtree(&self, root: u32) -> FreedCounts {
        let mut counts = FreedCounts::default();
        let mut blocks = Vec::new();
        let mut stack = vec![self.nodes.child_pointer(root)];

        while let Some(pointer) = stack.pop() {
            if pointer == 0 {
                continue;
            }
            let index = pointer & INDEX_MASK;
            if pointer & LEAF_FLAG != 0 {
                if self.leaves.get(index).is_lod() {
                    self.leaves.free_run(index);
                    counts.lod_runs += 1;
                } else {
                    self.leaves.free_leaf(index);
                    counts.sparsity_leaves += 1;
                }
                continue;
            }
            debug_assert!(index % BLOCK_SIZE == 0);
            for i in 0..BLOCK_SIZE {
                stack.push(self.nodes.child_pointer(index + i));
            }
            blocks.push(index);
        }

        counts.blocks = blocks.len();
        for head in blocks {
            self.nodes.free_block(head);
        }
        self.nodes.clear(root);
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_arena_starts_with_root_block() {
        let nodes = NodeArena::new();
        assert_eq!(nodes.len(), 64);
        assert!(nodes.get(0).is_unset());
        assert_eq!(nodes.alloc_block(), 64);
        assert_eq!(nodes.alloc_block(), 128);
        assert_eq!(nodes.len(), 192);
    }

    #[test]
    fn test_free_block_reuse_and_zeroing() {
        let nodes = NodeArena::new();
        let a = nodes.alloc_block();
        let b = nodes.alloc_block();
        nodes.set(a + 3, b, 0xFF);
        nodes.free_block(a);
        assert_eq!(nodes.free_block_count(), 1);
        assert!(nodes.get(a + 3).is_unset());
        assert_eq!(nodes.get(a + 3).child_mask(), 0);
        // Reused before the arena grows
        let len = nodes.len();
        assert_eq!(nodes.alloc_block(), a);
        assert_eq!(nodes.len(), len);
    }

    #[test]
    fn test_leaf_arena_free_lists() {
        let leaves = LeafArena::new();
        let single = leaves.alloc_leaf(Leaf::sparsity(3.0));
        let run = leaves.alloc_run();
        assert_eq!(single, 0);
        assert_eq!(run, 1);
        assert_eq!(leaves.len(), 65);
        assert_eq!(leaves.get(single).distance, 3.0);

        leaves.free_leaf(single);
        leaves.free_run(run);
        assert_eq!(leaves.free_counts(), (1, 1));
        assert_eq!(leaves.get(single), Leaf::EMPTY);

        assert_eq!(leaves.alloc_run(), run);
        assert_eq!(leaves.alloc_leaf(Leaf::sparsity(-1.0)), single);
        assert_eq!(leaves.len(), 65);
    }

    #[test]
    fn test_single_leaf_splits_freed_run() {
        let leaves = LeafArena::new();
        let run = leaves.alloc_run();
        leaves.free_run(run);
        let len = leaves.len();

        let first = leaves.alloc_leaf(Leaf::sparsity(5.0));
        assert_eq!(first, run);
        assert_eq!(leaves.len(), len);
        assert_eq!(leaves.free_counts(), (63, 0));
        assert_eq!(leaves.get(first).distance, 5.0);

        // The rest of the run serves later singles before the arena grows
        for _ in 0..63 {
            let index = leaves.alloc_leaf(Leaf::sparsity(-2.0));
            assert!(index > run && index < run + 64);
        }
        assert_eq!(leaves.len(), len);
        assert_eq!(leaves.alloc_leaf(Leaf::sparsity(1.0)), len as u32);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free of leaf")]
    fn test_double_free_leaf_panics() {
        let leaves = LeafArena::new();
        let index = leaves.alloc_leaf(Leaf::sparsity(3.0));
        leaves.free_leaf(index);
        leaves.free_leaf(index);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free of block")]
    fn test_double_free_block_panics() {
        let nodes = NodeArena::new();
        let head = nodes.alloc_block();
        nodes.free_block(head);
        nodes.free_block(head);
    }

    #[test]
    fn test_many_frees_then_reuse() {
        let leaves = LeafArena::new();
        let indices: Vec<u32> = (0..10_000).map(|i| leaves.alloc_leaf(Leaf::sparsity(i as f32 + 1.0))).collect();
        for &index in &indices {
            leaves.free_leaf(index);
        }
        assert_eq!(leaves.free_counts(), (10_000, 0));
        for _ in 0..10_000 {
            leaves.alloc_leaf(Leaf::sparsity(-1.0));
        }
        assert_eq!(leaves.len(), 10_000);
        assert_eq!(leaves.free_counts(), (0, 0));
    }

    #[test]
    fn test_dirty_ranges_coalesce() {
        let nodes = NodeArena::new();
        nodes.alloc_block();
        nodes.alloc_block();
        // Fresh storage is dirty and coalesces into one range
        assert_eq!(nodes.take_dirty(), vec![0..192]);
        assert!(nodes.take_dirty().is_empty());

        nodes.set(70, LEAF_FLAG | 1, 0);
        nodes.set(130, LEAF_FLAG | 2, 0);
        assert_eq!(nodes.take_dirty(), vec![64..192]);

        nodes.set(5, 64, 0);
        nodes.set(140, LEAF_FLAG, 0);
        assert_eq!(nodes.take_dirty(), vec![0..64, 128..192]);
    }

    #[test]
    fn test_leaf_dirty_range_bounded_by_len() {
        let leaves = LeafArena::new();
        leaves.alloc_leaf(Leaf::sparsity(1.0));
        leaves.alloc_leaf(Leaf::sparsity(2.0));
        assert_eq!(leaves.take_dirty(), vec![0..2]);
    }

    #[test]
    fn test_free_subtree() {
        let arenas = Arenas::new();
        let root = 0;
        let block = arenas.nodes.alloc_block();
        arenas.nodes.set(root, block, 0);

        // child 0: sparsity leaf, child 1: LOD run, child 2: nested block
        let sparse = arenas.leaves.alloc_leaf(Leaf::sparsity(9.0));
        arenas.nodes.set(block, sparse | LEAF_FLAG, 0);

        let run = arenas.leaves.alloc_run();
        for i in 0..64 {
            arenas.leaves.set(run + i, Leaf::voxel(if i % 2 == 0 { -1.0 } else { 1.0 }));
        }
        arenas.nodes.set(block + 1, run | LEAF_FLAG, 0x5555_5555_5555_5555);

        let nested = arenas.nodes.alloc_block();
        arenas.nodes.set(block + 2, nested, 0);
        let deep = arenas.leaves.alloc_leaf(Leaf::sparsity(-4.0));
        arenas.nodes.set(nested + 10, deep | LEAF_FLAG, 0);

        let counts = arenas.free_subtree(root);
        assert_eq!(counts, FreedCounts { blocks: 2, sparsity_leaves: 2, lod_runs: 1 });
        assert!(arenas.nodes.get(root).is_unset());
        assert_eq!(arenas.nodes.free_block_count(), 2);
        assert_eq!(arenas.leaves.free_counts(), (2, 1));
        assert!(arenas.nodes.snapshot().iter().all(|n| n.is_unset()));
        assert!(arenas.leaves.snapshot().iter().all(|l| *l == Leaf::EMPTY));
    }

    #[test]
    fn test_concurrent_alloc_is_disjoint() {
        let nodes = std::sync::Arc::new(NodeArena::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let nodes = nodes.clone();
                std::thread::spawn(move || (0..50).map(|_| nodes.alloc_block()).collect::<Vec<_>>())
            })
            .collect();
        let mut heads: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        heads.sort_unstable();
        heads.dedup();
        assert_eq!(heads.len(), 400);
        assert!(heads.iter().all(|h| h % 64 == 0 && *h != 0));
        assert_eq!(nodes.len(), 64 + 400 * 64);
    }
}
