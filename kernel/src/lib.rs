//! Quill-OS scheduler core
//!
//! Per-CPU processor state, critical-section and IRQ nesting tracking,
//! deferred call execution, wait queues and the preemptive thread scheduler.
//!
//! This crate is the scheduling subsystem of the kernel, not the kernel
//! itself: boot code, interrupt stubs, memory management and drivers live in
//! the embedding kernel and talk to this crate through `arch::Cpu` and the
//! public scheduler API.
#![no_std]

extern crate alloc;

pub mod arch;
pub mod logger;
pub mod processor;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use arch::{Cpu, CpuId, IrqState};
pub use processor::{CriticalGuard, ProcessorRegistry, ProcessorState, TrapFrame};
pub use scheduler::{idle_loop, Scheduler, SchedulerStats};
pub use sync::{WaitQueue, WaitResult};
pub use thread::{Thread, ThreadId, ThreadPriority, ThreadState};
