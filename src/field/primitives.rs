//! SDF primitives and combinators usable as field samplers.
//!
//! Free functions follow the usual SDF conventions (negative inside). The
//! structs wrap them as [`FieldSampler`]s so simple scenes can be composed
//! without writing closures.

use glam::Vec3;

use super::sampler::FieldSampler;

// =============================================================================
// SDF Primitives
// =============================================================================

/// Distance to a sphere
#[inline]
pub fn sdf_sphere(p: Vec3, center: Vec3, radius: f32) -> f32 {
    (p - center).length() - radius
}

/// Distance to a plane through `point` with unit `normal` (solid below)
#[inline]
pub fn sdf_plane(p: Vec3, point: Vec3, normal: Vec3) -> f32 {
    (p - point).dot(normal)
}

/// Distance to an axis-aligned box with the given half extents
#[inline]
pub fn sdf_box(p: Vec3, center: Vec3, half_extents: Vec3) -> f32 {
    let q = (p - center).abs() - half_extents;
    q.max(Vec3::ZERO).length() + q.max_element().min(0.0)
}

// =============================================================================
// SDF Combinations
// =============================================================================

/// Smooth minimum (polynomial smooth blend)
#[inline]
pub fn smin(a: f32, b: f32, k: f32) -> f32 {
    let h = (k - (b - a).abs()).max(0.0) / k;
    b.min(a) - h * h * k * 0.25
}

/// Union (min of two distances)
#[inline]
pub fn sdf_union(a: f32, b: f32) -> f32 {
    a.min(b)
}

/// Subtraction: inside a, outside b
#[inline]
pub fn sdf_subtraction(a: f32, b: f32) -> f32 {
    (-b).max(a)
}

/// Intersection (max of two distances)
#[inline]
pub fn sdf_intersection(a: f32, b: f32) -> f32 {
    a.max(b)
}

// =============================================================================
// Samplers
// =============================================================================

/// Horizontal floor: solid below `height`.
#[derive(Clone, Copy, Debug)]
pub struct Floor {
    pub height: f32,
}

impl FieldSampler for Floor {
    #[inline]
    fn sample(&self, p: Vec3) -> f32 {
        p.y - self.height
    }
}

/// Arbitrary half-space.
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub point: Vec3,
    /// Must be normalized
    pub normal: Vec3,
}

impl FieldSampler for Plane {
    #[inline]
    fn sample(&self, p: Vec3) -> f32 {
        sdf_plane(p, self.point, self.normal)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl FieldSampler for Sphere {
    #[inline]
    fn sample(&self, p: Vec3) -> f32 {
        sdf_sphere(p, self.center, self.radius)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Cuboid {
    pub center: Vec3,
    pub half_extents: Vec3,
}

impl FieldSampler for Cuboid {
    #[inline]
    fn sample(&self, p: Vec3) -> f32 {
        sdf_box(p, self.center, self.half_extents)
    }
}

/// How two fields are combined by [`Combine`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CombineOp {
    Union,
    Intersection,
    /// Keep `a`, carve out `b`
    Subtraction,
    /// Union blended over radius `k`
    SmoothUnion(f32),
}

/// Two fields joined by a CSG operation.
pub struct Combine<A, B> {
    pub a: A,
    pub b: B,
    pub op: CombineOp,
}

impl<A: FieldSampler, B: FieldSampler> Combine<A, B> {
    pub fn new(a: A, b: B, op: CombineOp) -> Self {
        Self { a, b, op }
    }
}

impl<A: FieldSampler, B: FieldSampler> FieldSampler for Combine<A, B> {
    fn sample(&self, p: Vec3) -> f32 {
        let a = self.a.sample(p);
        let b = self.b.sample(p);
        match self.op {
            CombineOp::Union => sdf_union(a, b),
            CombineOp::Intersection => sdf_intersection(a, b),
            CombineOp::Subtraction => sdf_subtraction(a, b),
            CombineOp::SmoothUnion(k) => smin(a, b, k),
        }
    }
}
