//! Implicit scalar fields and the Lipschitz bound derived from them

pub mod sampler;
pub mod bound;
pub mod primitives;
pub mod terrain;

pub use sampler::FieldSampler;
pub use bound::{bound, HALF_DIAGONAL};
pub use terrain::{TerrainField, TerrainParams};
