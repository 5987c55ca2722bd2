//! Blocking synchronization primitives built on the scheduler.

pub mod wait_queue;

pub use wait_queue::{WaitQueue, WaitResult};
