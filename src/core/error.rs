//! Error types for the sdotree crate

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The field sampler panicked during a build; affected nodes stay unset
    #[error("Field sampler panicked: {0}")]
    Sampler(String),

    /// The work channel was closed while waiting on it
    #[error("channel closed")]
    Closed,
}
