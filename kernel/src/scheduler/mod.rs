//! Preemptive priority scheduler
//!
//! Fixed priority levels with round-robin rotation inside each level,
//! per-CPU run queues, slice-based preemption at timer-tick boundaries and
//! mailbox-mediated cross-CPU wakeups.

pub mod idle;
pub mod run_queue;
pub mod scheduler;

pub use idle::idle_loop;
pub use scheduler::{Scheduler, SchedulerStats};
