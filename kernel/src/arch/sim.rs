//! Software CPU backend
//!
//! A deterministic implementation of [`Cpu`] with no hardware behind it.
//! The interrupt flag is an atomic bool, the timestamp is a counter the
//! timer driver (or a test) advances explicitly, and a context switch is
//! pure bookkeeping. This is the backend the scheduler test suite runs on.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{new_irq_state, Cpu, IrqState};

/// Saved register context of one thread, as far as this backend is
/// concerned: switch-in/switch-out counters instead of register contents.
#[derive(Debug, Default)]
pub struct Context {
    switched_in: AtomicU64,
    switched_out: AtomicU64,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            switched_in: AtomicU64::new(0),
            switched_out: AtomicU64::new(0),
        }
    }

    /// How many times this context has been resumed.
    pub fn resume_count(&self) -> u64 {
        self.switched_in.load(Ordering::Relaxed)
    }
}

/// One simulated CPU core.
#[derive(Debug)]
pub struct SimCpu {
    irq_enabled: AtomicBool,
    now: AtomicU64,
    switches: AtomicU64,
    halts: AtomicU64,
}

impl SimCpu {
    pub const fn new() -> Self {
        Self {
            irq_enabled: AtomicBool::new(true),
            now: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            halts: AtomicU64::new(0),
        }
    }

    /// Advance the monotonic clock. Stands in for the external timer.
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn context_switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn halt_count(&self) -> u64 {
        self.halts.load(Ordering::Relaxed)
    }
}

impl Default for SimCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for SimCpu {
    fn disable_interrupts(&self) -> IrqState {
        let was = self.irq_enabled.swap(false, Ordering::AcqRel);
        new_irq_state(was)
    }

    fn restore_interrupts(&self, state: IrqState) {
        self.irq_enabled.store(state.was_enabled(), Ordering::Release);
    }

    fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire)
    }

    fn timestamp(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn switch_context(&self, from: &Context, to: &Context) {
        from.switched_out.fetch_add(1, Ordering::Relaxed);
        to.switched_in.fetch_add(1, Ordering::Relaxed);
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }
}
