//! GPU interfaces: device context and mirrored storage buffers

pub mod context;
pub mod buffer;

pub use context::HeadlessContext;
