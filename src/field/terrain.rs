//! FBM heightfield terrain used as the reference field.

use glam::Vec3;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use super::sampler::FieldSampler;
use crate::core::types::Result;

/// Parameters controlling terrain generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainParams {
    pub seed: u32,
    pub scale: f32,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical range of the noise
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f32,  // FBM persistence (0.5 typical)
    pub lacunarity: f32,   // FBM lacunarity (2.0 typical)
    pub base_height: f32,  // Height of the lowest possible terrain point
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 64.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            base_height: -32.0,
        }
    }
}

impl TerrainParams {
    /// Load terrain parameters from a JSON file. Missing fields use defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Rough upper bound on `|grad h|`, summed over octaves.
    pub fn max_slope(&self) -> f32 {
        let mut amplitude = 1.0f32;
        let mut frequency = 1.0f32;
        let mut total_amplitude = 0.0f32;
        let mut slope = 0.0f32;
        for _ in 0..self.octaves.max(1) {
            total_amplitude += amplitude;
            slope += amplitude * frequency;
            amplitude *= self.persistence;
            frequency *= self.lacunarity;
        }
        // Noise is normalized by total amplitude, then mapped from [-1,1] to [0,height_scale]
        0.5 * self.height_scale / self.scale * slope / total_amplitude
    }
}

/// Heightfield terrain: `f(p) = (p.y - h(p.x, p.z)) * k`.
///
/// `k = 1 / sqrt(1 + max_slope^2)` rescales the vertical distance so the
/// field stays approximately 1-Lipschitz on steep slopes.
pub struct TerrainField {
    params: TerrainParams,
    noise: Fbm<Perlin>,
    lipschitz_scale: f32,
}

impl TerrainField {
    /// Create a new terrain field with the given parameters
    pub fn new(params: TerrainParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);
        let slope = params.max_slope();
        let lipschitz_scale = 1.0 / (1.0 + slope * slope).sqrt();

        Self { params, noise, lipschitz_scale }
    }

    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Terrain height at world position (x, z)
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let nx = (x / self.params.scale) as f64;
        let nz = (z / self.params.scale) as f64;

        // Noise value in [-1, 1]
        let noise_value = self.noise.get([nx, nz]).clamp(-1.0, 1.0);

        let normalized = (noise_value + 1.0) / 2.0;
        self.params.base_height + (normalized * self.params.height_scale as f64) as f32
    }
}

impl FieldSampler for TerrainField {
    fn sample(&self, p: Vec3) -> f32 {
        (p.y - self.height_at(p.x, p.z)) * self.lipschitz_scale
    }
}
