//! Tree build configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Deepest tree supported; `4^15` edge ratios still fit comfortably in f32.
pub const MAX_SUPPORTED_DEPTH: u32 = 15;

/// Configuration for building and maintaining a distance octree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Maximum depth `D`. Root is depth 0.
    pub max_depth: u32,
    /// Finest voxel edge length `s0` (edge of a node at depth `D`).
    pub base_voxel_size: f32,
    /// Distance at which detail starts dropping one level per doubling.
    pub lod_threshold: f32,
    /// Coarsest depth the LOD schedule is allowed to reach.
    pub min_lod_depth: u32,
    /// Observer motion below this distance does not trigger a stale scan.
    pub observer_threshold: f32,
    /// Relative surface epsilon used by the bound clamp.
    pub surface_epsilon: f32,
    /// Worker threads; `None` uses hardware concurrency (min 4).
    pub worker_count: Option<usize>,
    /// Capacity of the bounded work channel.
    pub channel_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 9,
            base_voxel_size: 0.25,
            lod_threshold: 128.0,
            min_lod_depth: 3,
            observer_threshold: 10.0,
            surface_epsilon: 0.33 * 0.01,
            worker_count: None,
            channel_capacity: 4096,
        }
    }
}

impl TreeConfig {
    /// Load a config from a JSON file. Missing fields use defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Save as pretty-printed JSON.
    pub fn save_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject configurations the builder cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(Error::Config("max_depth must be > 0".into()));
        }
        if self.max_depth > MAX_SUPPORTED_DEPTH {
            return Err(Error::Config(format!(
                "max_depth {} exceeds {}",
                self.max_depth, MAX_SUPPORTED_DEPTH
            )));
        }
        if !(self.base_voxel_size > 0.0) {
            return Err(Error::Config("base_voxel_size must be > 0".into()));
        }
        if !(self.lod_threshold > 0.0) {
            return Err(Error::Config("lod_threshold must be > 0".into()));
        }
        if !(self.observer_threshold >= 0.0) {
            return Err(Error::Config("observer_threshold must be >= 0".into()));
        }
        if !(self.surface_epsilon > 0.0) {
            return Err(Error::Config("surface_epsilon must be > 0".into()));
        }
        if self.worker_count == Some(0) {
            return Err(Error::Config("worker_count must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Number of worker threads to spawn.
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(4)
        })
    }

    /// Edge length of a node at `depth`: `s0 * 4^(D - depth)`.
    pub fn edge_at(&self, depth: u32) -> f32 {
        let levels = self.max_depth.saturating_sub(depth) as i32;
        self.base_voxel_size * 4f32.powi(levels)
    }

    /// Edge length of the root cube.
    pub fn root_edge(&self) -> f32 {
        self.edge_at(0)
    }
}
