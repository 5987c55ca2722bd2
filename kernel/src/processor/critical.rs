//! Critical section tracking
//!
//! Reentrant per-CPU critical sections gate preemption: while the depth is
//! nonzero the scheduler will not run on this CPU. Leaving the outermost
//! section is the single point where deferred calls drain and where an
//! asynchronously requested reschedule is honored.
//!
//! Violations here are kernel bugs, not runtime conditions; every
//! precondition is a fatal assertion.

use crate::arch::Cpu;
use crate::processor::ProcessorState;

impl ProcessorState {
    /// Enter a critical section (reentrant). Preemption is logically
    /// disabled until the matching `leave_critical`.
    pub fn enter_critical(&self) {
        use core::sync::atomic::Ordering;
        self.critical_depth_cell().fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a critical section.
    ///
    /// Runs with hardware interrupts disabled around the decrement so an
    /// interrupt handler on this CPU cannot observe a half-done exit. At
    /// the outermost boundary (depth 1 -> 0), and only when not nested
    /// inside an interrupt handler, pending deferred calls drain and a
    /// requested reschedule runs.
    pub fn leave_critical(&self) {
        use core::sync::atomic::Ordering;

        let irq_state = self.cpu().disable_interrupts();

        let depth = self.critical_depth_cell().load(Ordering::Acquire);
        assert!(depth > 0, "leave_critical without matching enter_critical");

        if depth == 1 {
            if self.in_irq() == 0 {
                // Deferred closures may allocate or block; they must never
                // see interrupt context. Depth is still 1 here, so a
                // handler entering and leaving its own critical section
                // nests without re-draining.
                self.deferred_pool().execute_pending();
            }
            self.critical_depth_cell().store(0, Ordering::Release);
            if self.in_irq() == 0 {
                self.check_invoke_scheduler();
            }
        } else {
            self.critical_depth_cell().store(depth - 1, Ordering::Release);
        }

        self.cpu().restore_interrupts(irq_state);
    }

    /// Restore the critical depth saved by a thread when it was last
    /// switched out. Called immediately after a context switch completes,
    /// on the new thread's behalf.
    pub fn restore_critical(&self, saved_depth: u32) {
        use core::sync::atomic::Ordering;
        self.critical_depth_cell().store(saved_depth, Ordering::Release);
    }

    /// The single invocation point for asynchronously requested reschedules.
    ///
    /// Preconditions (fatal if violated): interrupts disabled, not inside
    /// an interrupt handler, not inside a critical section. Consumes the
    /// request flag exactly once, and only once the scheduler subsystem has
    /// finished initializing.
    pub fn check_invoke_scheduler(&self) {
        assert!(
            !self.cpu().interrupts_enabled(),
            "check_invoke_scheduler with interrupts enabled"
        );
        assert_eq!(self.in_irq(), 0, "scheduler invocation inside IRQ");
        assert_eq!(
            self.in_critical(),
            0,
            "scheduler invocation inside critical section"
        );

        if !self.invoke_scheduler_async_pending() {
            return;
        }
        if let Some(scheduler) = self.scheduler() {
            self.clear_invoke_scheduler_async();
            scheduler.invoke_async(self);
        }
    }
}

/// RAII critical section: enters on construction, leaves on drop, so every
/// exit path of the enclosing scope releases exactly once.
pub struct CriticalGuard<'a> {
    proc: &'a ProcessorState,
}

impl<'a> CriticalGuard<'a> {
    pub fn new(proc: &'a ProcessorState) -> Self {
        proc.enter_critical();
        Self { proc }
    }
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.proc.leave_critical();
    }
}
