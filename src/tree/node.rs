//! GPU node and leaf records

use bytemuck::{Pod, Zeroable};

/// Children per interior node (4x4x4)
pub const BLOCK_SIZE: u32 = 64;

/// Set in `child_pointer` when the low bits index the leaf arena
pub const LEAF_FLAG: u32 = 0x8000_0000;

/// Mask for the index part of a `child_pointer`
pub const INDEX_MASK: u32 = !LEAF_FLAG;

/// Leaf flags
pub mod flags {
    /// Leaf is one voxel of a 64-leaf LOD run (else a sparsity leaf)
    pub const LOD: u8 = 1 << 0;
}

/// Leaf material
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Material {
    #[default]
    Void = 0,
    Air = 1,
    Water = 2,
    Dirt = 3,
    Stone = 4,
    Grass = 5,
    Sand = 6,
    Wood = 7,
    Leaf = 8,
    Glass = 9,
    Torch = 10,
}

impl Material {
    /// Decode a stored material byte; unknown values read as `Void`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Air,
            2 => Self::Water,
            3 => Self::Dirt,
            4 => Self::Stone,
            5 => Self::Grass,
            6 => Self::Sand,
            7 => Self::Wood,
            8 => Self::Leaf,
            9 => Self::Glass,
            10 => Self::Torch,
            _ => Self::Void,
        }
    }
}

/// Tree node - 16 bytes, std430 compatible
///
/// WGSL has no 64-bit integers, so the child mask is split into two words.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Node {
    /// `LEAF_FLAG | leaf_index`, first index of a 64-child block, or 0 if unset
    pub child_pointer: u32,
    /// Low 32 bits of the solid-voxel mask (LOD leaves only)
    pub child_mask_lo: u32,
    /// High 32 bits of the solid-voxel mask
    pub child_mask_hi: u32,
    _pad: u32,
}

impl Node {
    pub const EMPTY: Node = Node {
        child_pointer: 0,
        child_mask_lo: 0,
        child_mask_hi: 0,
        _pad: 0,
    };

    pub fn new(child_pointer: u32, child_mask: u64) -> Self {
        Self {
            child_pointer,
            child_mask_lo: child_mask as u32,
            child_mask_hi: (child_mask >> 32) as u32,
            _pad: 0,
        }
    }

    pub fn child_mask(&self) -> u64 {
        (self.child_mask_hi as u64) << 32 | self.child_mask_lo as u64
    }

    /// Check if this node references the leaf arena
    pub fn is_leaf(&self) -> bool {
        self.child_pointer & LEAF_FLAG != 0
    }

    /// Check if this node has a child block
    pub fn is_interior(&self) -> bool {
        self.child_pointer != 0 && !self.is_leaf()
    }

    /// Not yet subdivided (or freed)
    pub fn is_unset(&self) -> bool {
        self.child_pointer == 0
    }

    /// Index into the leaf or node arena, without the flag bit
    pub fn index(&self) -> u32 {
        self.child_pointer & INDEX_MASK
    }
}

/// Leaf record - 8 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Leaf {
    /// Signed distance bound (sparsity leaf) or voxel distance (LOD leaf)
    pub distance: f32,
    pub material: u8,
    pub damage: u8,
    pub flags: u8,
    _pad: u8,
}

impl Leaf {
    pub const EMPTY: Leaf = Leaf {
        distance: 0.0,
        material: 0,
        damage: 0,
        flags: 0,
        _pad: 0,
    };

    /// Single-distance leaf covering an empty or fully solid cube
    pub fn sparsity(distance: f32) -> Self {
        let material = if distance < 0.0 { Material::Stone } else { Material::Air };
        Self {
            distance,
            material: material as u8,
            damage: 0,
            flags: 0,
            _pad: 0,
        }
    }

    /// One voxel of a LOD run
    pub fn voxel(distance: f32) -> Self {
        let material = if distance < 0.0 { Material::Grass } else { Material::Void };
        Self {
            distance,
            material: material as u8,
            damage: 0,
            flags: flags::LOD,
            _pad: 0,
        }
    }

    pub fn is_lod(&self) -> bool {
        self.flags & flags::LOD != 0
    }

    pub fn material(&self) -> Material {
        Material::from_u8(self.material)
    }

    pub fn to_bits(self) -> u64 {
        bytemuck::cast(self)
    }

    pub fn from_bits(bits: u64) -> Self {
        bytemuck::cast(bits)
    }
}
