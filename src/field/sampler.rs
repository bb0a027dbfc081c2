//! Field sampler trait.

use glam::Vec3;

/// A signed scalar field: negative inside solid, zero on the surface,
/// positive outside.
///
/// Implementations must be pure and thread-safe; the builder samples from
/// every worker concurrently. A field that is not 1-Lipschitz still builds,
/// but empty-space bounds are no longer conservative.
pub trait FieldSampler: Send + Sync {
    /// Signed distance (or distance-like value) at `p`.
    fn sample(&self, p: Vec3) -> f32;
}

impl<F> FieldSampler for F
where
    F: Fn(Vec3) -> f32 + Send + Sync,
{
    #[inline]
    fn sample(&self, p: Vec3) -> f32 {
        self(p)
    }
}

impl FieldSampler for Box<dyn FieldSampler> {
    #[inline]
    fn sample(&self, p: Vec3) -> f32 {
        (**self).sample(p)
    }
}
