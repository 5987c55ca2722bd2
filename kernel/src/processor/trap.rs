//! Trap entry/exit bookkeeping
//!
//! The interrupt dispatch layer calls `enter_trap` on every trap or
//! interrupt entry, before the specific handler runs, and `exit_trap` on
//! the way out. Frames live on the interrupt path's stack and are linked
//! into a per-thread chain so nested traps unwind to the correct outer
//! context. Mode changes (kernel vs user) accrue elapsed time to the
//! matching per-thread bucket.

use core::ptr;

use crate::arch::Cpu;
use crate::processor::ProcessorState;
use crate::thread::Thread;

/// Execution mode a CPU was in before a trap boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreviousMode {
    Kernel = 0,
    User = 1,
}

impl PreviousMode {
    pub(crate) fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Kernel,
            _ => Self::User,
        }
    }
}

/// Saved context of one trap/interrupt entry.
///
/// Stack-owned by the interrupt path; never heap-allocated. `next_trap`
/// points at the frame of the trap this one nested inside, if any.
#[derive(Debug)]
pub struct TrapFrame {
    /// IRQ nesting depth before this trap raised it; restored on exit.
    pub prev_irq_level: u32,
    /// Outer frame in the current thread's chain, or null.
    pub next_trap: *mut TrapFrame,
    /// Whether the interrupted context was running in user mode.
    pub from_user: bool,
}

impl TrapFrame {
    pub fn new(from_user: bool) -> Self {
        Self {
            prev_irq_level: 0,
            next_trap: ptr::null_mut(),
            from_user,
        }
    }

    fn mode(&self) -> PreviousMode {
        if self.from_user {
            PreviousMode::User
        } else {
            PreviousMode::Kernel
        }
    }
}

impl ProcessorState {
    /// Record a trap entry. Requires interrupts disabled.
    ///
    /// `raise_irq` is true for genuine external interrupts and false for
    /// synchronous exceptions, which do not change the IRQ nesting depth.
    pub fn enter_trap(&self, trap: &mut TrapFrame, raise_irq: bool) {
        use core::sync::atomic::Ordering;

        assert!(
            !self.cpu().interrupts_enabled(),
            "enter_trap with interrupts enabled"
        );

        trap.prev_irq_level = self.in_irq();
        if raise_irq {
            self.irq_depth_cell().fetch_add(1, Ordering::AcqRel);
        }

        let thread = self
            .current_thread()
            .expect("trap taken with no current thread");

        // Link this frame as the innermost trap of the current thread.
        trap.next_trap = thread.current_trap();
        thread.set_current_trap(trap as *mut TrapFrame);

        // The period that just ended was spent in the interrupted mode;
        // from here until exit_trap the thread executes kernel code.
        self.account_mode_end(&thread, trap.mode());
        thread.set_previous_mode(PreviousMode::Kernel);
    }

    /// Unwind a trap entry recorded by `enter_trap`. Requires interrupts
    /// disabled and the frame to be the innermost one.
    ///
    /// When this exit brings both the IRQ and critical depths to zero, a
    /// pending reschedule request is honored here.
    pub fn exit_trap(&self, trap: &mut TrapFrame) {
        use core::sync::atomic::Ordering;

        assert!(
            !self.cpu().interrupts_enabled(),
            "exit_trap with interrupts enabled"
        );

        let thread = self
            .current_thread()
            .expect("trap exit with no current thread");
        assert!(
            core::ptr::eq(thread.current_trap(), trap as *mut TrapFrame),
            "exit_trap out of order"
        );

        self.irq_depth_cell()
            .store(trap.prev_irq_level, Ordering::Release);
        thread.set_current_trap(trap.next_trap);

        // Handler time was kernel time. The outermost exit resumes the
        // interrupted context; a nested exit resumes the outer handler,
        // which is still kernel code.
        self.account_mode_end(&thread, PreviousMode::Kernel);
        let return_mode = if trap.next_trap.is_null() {
            trap.mode()
        } else {
            PreviousMode::Kernel
        };
        thread.set_previous_mode(return_mode);

        if self.in_irq() == 0 && self.in_critical() == 0 {
            self.check_invoke_scheduler();
        }
    }

    /// Close the current accounting period: ticks since the last watermark
    /// belong to `ended_mode`.
    fn account_mode_end(&self, thread: &Thread, ended_mode: PreviousMode) {
        let now = self.cpu().timestamp();
        let elapsed = now.saturating_sub(thread.last_scheduled());
        if elapsed > 0 {
            thread.accrue_ticks(ended_mode, elapsed);
        }
        thread.set_last_scheduled(now);
    }
}
