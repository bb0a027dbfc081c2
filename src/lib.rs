//! sdotree - sparse distance octree builder for ray-marched voxel terrain

pub mod core;
pub mod field;
pub mod render;
pub mod sync;
pub mod tree;
