//! Thread metadata consumed by the scheduler

pub mod state;
pub mod thread;

pub use state::{validate_transition, AtomicThreadState, ThreadState};
pub use thread::{Thread, ThreadFlags, ThreadId, ThreadPriority, WakeCause, PRIORITY_LEVELS};
