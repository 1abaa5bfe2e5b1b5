//! Queues used for every hand-off between threads

pub mod frames;
pub mod ring;

pub use frames::{FrameQueue, ReceiveQueues};
pub use ring::BoundedQueue;
