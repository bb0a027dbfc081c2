//! Synchronization primitives shared by the builder and its control thread

pub mod channel;
pub mod wait_group;

pub use channel::WorkChannel;
pub use wait_group::WaitGroup;
