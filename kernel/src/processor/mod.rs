//! Per-CPU processor state
//!
//! One `ProcessorState` per core: the currently running thread, the idle
//! thread, critical-section and IRQ nesting depths, the async-reschedule
//! flag, the deferred call pool and the SMP mailbox. The counters and the
//! current-thread slot are owned exclusively by their CPU; remote CPUs go
//! through the mailbox ([`smp`]) instead of touching them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, Once};

use crate::arch::{ArchCpu, Cpu, CpuId};
use crate::scheduler::Scheduler;
use crate::thread::Thread;

pub mod critical;
pub mod deferred;
pub mod registry;
pub mod smp;
pub mod trap;

pub use critical::CriticalGuard;
pub use deferred::{DeferredCallPool, DEFERRED_CALL_POOL_SIZE};
pub use registry::ProcessorRegistry;
pub use smp::{Mailbox, SmpMessage};
pub use trap::{PreviousMode, TrapFrame};

/// State of one CPU core. Created at bring-up, never destroyed.
pub struct ProcessorState {
    id: CpuId,
    cpu: ArchCpu,

    /// Thread presently executing here. Written only by the scheduler, on
    /// this CPU, under the scheduler lock.
    current_thread: Mutex<Option<Arc<Thread>>>,

    /// Set once at bring-up; alive as long as the CPU is.
    idle_thread: Once<Arc<Thread>>,

    /// Critical-section nesting depth. Zero means preemption is allowed.
    in_critical: AtomicU32,

    /// Interrupt-handler nesting depth. Scheduling waits for zero.
    in_irq: AtomicU32,

    /// A reschedule was requested but could not run at the time; consumed
    /// exactly once when both depths return to zero.
    invoke_scheduler_async: AtomicBool,

    deferred: DeferredCallPool,
    mailbox: Mailbox,

    /// Owning scheduler, wired at bring-up. Empty until the scheduler
    /// subsystem finishes initializing.
    scheduler: Once<&'static Scheduler>,
}

impl ProcessorState {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            cpu: ArchCpu::new(),
            current_thread: Mutex::new(None),
            idle_thread: Once::new(),
            in_critical: AtomicU32::new(0),
            in_irq: AtomicU32::new(0),
            invoke_scheduler_async: AtomicBool::new(false),
            deferred: DeferredCallPool::new(),
            mailbox: Mailbox::new(),
            scheduler: Once::new(),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn cpu(&self) -> &ArchCpu {
        &self.cpu
    }

    pub fn in_critical(&self) -> u32 {
        self.in_critical.load(Ordering::Acquire)
    }

    pub fn in_irq(&self) -> u32 {
        self.in_irq.load(Ordering::Acquire)
    }

    pub(crate) fn critical_depth_cell(&self) -> &AtomicU32 {
        &self.in_critical
    }

    pub(crate) fn irq_depth_cell(&self) -> &AtomicU32 {
        &self.in_irq
    }

    /// Request a scheduler run at the next point both depths reach zero.
    pub fn set_invoke_scheduler_async(&self) {
        self.invoke_scheduler_async.store(true, Ordering::Release);
    }

    pub fn invoke_scheduler_async_pending(&self) -> bool {
        self.invoke_scheduler_async.load(Ordering::Acquire)
    }

    pub(crate) fn clear_invoke_scheduler_async(&self) -> bool {
        self.invoke_scheduler_async.swap(false, Ordering::AcqRel)
    }

    // ── Threads ─────────────────────────────────────────────────────────

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current_thread.lock().clone()
    }

    /// Scheduler-only. Caller holds the scheduler lock and runs on this CPU.
    pub(crate) fn set_current_thread(&self, thread: Arc<Thread>) {
        *self.current_thread.lock() = Some(thread);
    }

    pub fn idle_thread(&self) -> &Arc<Thread> {
        self.idle_thread
            .get()
            .expect("idle thread missing: CPU was not brought up")
    }

    pub(crate) fn set_idle_thread(&self, thread: Arc<Thread>) {
        self.idle_thread.call_once(|| thread);
    }

    // ── Scheduler wiring ────────────────────────────────────────────────

    pub(crate) fn attach_scheduler(&self, scheduler: &'static Scheduler) {
        self.scheduler.call_once(|| scheduler);
    }

    pub fn scheduler(&self) -> Option<&'static Scheduler> {
        self.scheduler.get().copied()
    }

    // ── Deferred calls ──────────────────────────────────────────────────

    pub(crate) fn deferred_pool(&self) -> &DeferredCallPool {
        &self.deferred
    }

    /// Queue a callback to run outside interrupt and critical-section
    /// context on this CPU.
    ///
    /// If the CPU is currently outside any critical section and outside any
    /// interrupt handler, the callback runs synchronously before this
    /// returns. Callers must only assume "executes no later than the end of
    /// the nearest enclosing critical section".
    pub fn deferred_call_queue(&self, handler: impl FnOnce() + Send + 'static) {
        let irq_state = self.cpu.disable_interrupts();
        self.deferred.queue(Box::new(handler));
        self.cpu.restore_interrupts(irq_state);

        if self.in_critical() == 0 && self.in_irq() == 0 {
            // Entering and immediately leaving drains at the 1 -> 0 boundary.
            self.enter_critical();
            self.leave_critical();
        }
    }

    // ── SMP mailbox ─────────────────────────────────────────────────────

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}
