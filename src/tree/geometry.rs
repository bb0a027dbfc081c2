//! Child placement within a 4x4x4 subdivision.
//!
//! Children are indexed `i = x + 4y + 16z`; child `i` of a node centered at
//! `parent` sits at `parent + (x - 1.5, y - 1.5, z - 1.5) * child_edge`.

use glam::{UVec3, Vec3};

/// Grid coordinates of child `i`.
#[inline]
pub fn child_coords(i: u32) -> UVec3 {
    debug_assert!(i < 64, "child index {i} out of range");
    UVec3::new(i & 3, (i >> 2) & 3, i >> 4)
}

/// Inverse of [`child_coords`].
#[inline]
pub fn child_index(coords: UVec3) -> u32 {
    debug_assert!(coords.max_element() < 4);
    coords.x + 4 * coords.y + 16 * coords.z
}

/// Center of child `i` given the child edge length.
#[inline]
pub fn child_center(i: u32, child_edge: f32, parent: Vec3) -> Vec3 {
    let c = child_coords(i).as_vec3() - Vec3::splat(1.5);
    parent + c * child_edge
}

/// Which child of a node centered at `parent` contains `p`, clamped to the grid.
pub fn child_containing(p: Vec3, child_edge: f32, parent: Vec3) -> u32 {
    let local = (p - parent) / child_edge + Vec3::splat(2.0);
    let cell = local.floor().clamp(Vec3::ZERO, Vec3::splat(3.0)).as_uvec3();
    child_index(cell)
}
