//! Architecture seam
//!
//! The scheduler core never touches hardware directly. Everything
//! architecture-specific (the interrupt-enable flag, the monotonic
//! timestamp, register save/restore on a context switch, the halt
//! instruction) sits behind the [`Cpu`] trait, one implementation per
//! architecture, selected at build time.
//!
//! This tree carries the software backend ([`sim`]); hardware backends live
//! with the embedding kernel's arch code and implement the same trait.

use core::fmt;

pub mod sim;

/// Active backend for this build.
pub type ArchCpu = sim::SimCpu;
pub use sim::Context;

/// Stable numeric CPU core id, assigned at bring-up, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Saved interrupt-enable state, handed back by [`Cpu::disable_interrupts`]
/// and consumed by [`Cpu::restore_interrupts`].
#[derive(Debug, Clone, Copy)]
pub struct IrqState {
    enabled: bool,
}

impl IrqState {
    pub fn was_enabled(self) -> bool {
        self.enabled
    }
}

/// Per-CPU architecture backend.
///
/// Each `ProcessorState` owns one instance; all methods act on the CPU that
/// owns it, never on a remote core.
pub trait Cpu: Send + Sync {
    /// Disable interrupt delivery, returning the previous state.
    fn disable_interrupts(&self) -> IrqState;

    /// Restore interrupt delivery to a previously saved state.
    fn restore_interrupts(&self, state: IrqState);

    fn interrupts_enabled(&self) -> bool;

    /// Monotonic tick counter, driven by the external timer subsystem.
    fn timestamp(&self) -> u64;

    /// Save the outgoing register context and resume the incoming one.
    /// Address-space activation for the incoming thread happens here too,
    /// by arrangement with the memory manager.
    fn switch_context(&self, from: &Context, to: &Context);

    /// Wait for the next interrupt. Used by the idle loop only.
    fn halt(&self);
}

pub(crate) fn new_irq_state(enabled: bool) -> IrqState {
    IrqState { enabled }
}
