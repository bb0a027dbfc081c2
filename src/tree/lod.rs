//! Distance-driven level of detail
//!
//! Detail is full out to the threshold `T`; beyond it one depth level is
//! dropped per doubling of distance, down to a floor:
//!
//! `L(r) = clamp(D - max(0, floor(log2(r / T))), min_lod, D)`

use glam::Vec3;

use crate::core::config::TreeConfig;

/// LOD policy parameters, extracted from [`TreeConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodPolicy {
    /// Maximum tree depth `D`
    pub max_depth: u32,
    /// Distance threshold `T`
    pub threshold: f32,
    /// Coarsest depth allowed
    pub min_depth: u32,
}

impl LodPolicy {
    pub fn new(max_depth: u32, threshold: f32, min_depth: u32) -> Self {
        Self { max_depth, threshold, min_depth }
    }

    pub fn from_config(config: &TreeConfig) -> Self {
        Self::new(config.max_depth, config.lod_threshold, config.min_lod_depth)
    }

    /// Target maximum depth for geometry at distance `r` from the observer.
    ///
    /// # Examples
    /// ```
    /// use sdotree::tree::lod::LodPolicy;
    ///
    /// let lod = LodPolicy::new(6, 64.0, 3);
    /// assert_eq!(lod.depth_at(32.0), 6);
    /// assert_eq!(lod.depth_at(128.0), 5);
    /// assert_eq!(lod.depth_at(10000.0), 3);
    /// ```
    pub fn depth_at(&self, r: f32) -> u32 {
        let floor = self.min_depth.min(self.max_depth);
        // NaN and anything inside the threshold get full detail
        if !(r > self.threshold) {
            return self.max_depth;
        }
        let drop = (r / self.threshold).log2().floor();
        if !drop.is_finite() || drop >= self.max_depth as f32 {
            return floor;
        }
        self.max_depth.saturating_sub(drop as u32).clamp(floor, self.max_depth)
    }

    /// Target depth for a node centered at `center` seen from `observer`.
    pub fn depth_for(&self, center: Vec3, observer: Vec3) -> u32 {
        self.depth_at(center.distance(observer))
    }

    /// Whether a node at `depth` must stop subdividing and emit a LOD leaf.
    /// A LOD leaf at depth `d` stores voxels of depth `d + 1`.
    pub fn is_lod_leaf_depth(&self, depth: u32, center: Vec3, observer: Vec3) -> bool {
        depth + 1 >= self.depth_for(center, observer)
    }
}
