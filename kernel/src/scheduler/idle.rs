//! Idle loop
//!
//! Every CPU gets an idle thread at bring-up. It is treated as perpetually
//! queued on its CPU, never enters a run queue, and is dispatched only when
//! nothing else is runnable. Its body just parks the CPU until the next
//! interrupt; the timer tick displaces it as soon as real work shows up.

use crate::arch::Cpu;
use crate::processor::ProcessorState;

/// Body of a CPU's idle thread. Never returns; every iteration waits for
/// an interrupt and loops.
pub fn idle_loop(proc: &ProcessorState) -> ! {
    loop {
        proc.cpu().halt();
    }
}
