//! GPU buffer management

pub mod mirrored;
pub mod tree_buffers;
pub mod chunked;

pub use mirrored::MirroredBuffer;
pub use tree_buffers::{TreeBuffers, NODE_BINDING, LEAF_BINDING};
pub use chunked::{ChunkedMirror, SlotInfo};
