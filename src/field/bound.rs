//! Lipschitz-safe distance bound over a cube.
//!
//! Given a sample `d` at the center of a cube of edge `s`, every point in the
//! cube lies within `s * sqrt(3) / 2` of the center, so a 1-Lipschitz field
//! keeps its sign and at least `|d| - s * sqrt(3) / 2` of its magnitude across
//! the whole cube.

/// Half the diagonal of a unit cube, `sqrt(3) / 2`.
pub const HALF_DIAGONAL: f32 = 0.866_025_4;

/// Conservative signed bound: `sign(d) * max(|d| - s*sqrt(3)/2, s*eps)`.
///
/// The sign of `d` is kept (zero counts as positive) and the magnitude never
/// falls below `s * eps`, so a ray-marcher always makes progress.
#[inline]
pub fn bound(d: f32, s: f32, eps: f32) -> f32 {
    let magnitude = (d.abs() - s * HALF_DIAGONAL).max(s * eps);
    if d < 0.0 { -magnitude } else { magnitude }
}

/// Whether a cube of edge `s` whose bounded center distance is `bounded` can
/// be skipped as a single sparsity leaf. Tolerance is `s * eps`.
#[inline]
pub fn is_sparse(bounded: f32, s: f32, eps: f32) -> bool {
    bounded.abs() > s * HALF_DIAGONAL - s * eps
}
