//! Cross-CPU signaling
//!
//! A CPU never mutates another CPU's `ProcessorState`. Cross-CPU effects
//! ("you have new runnable work, reschedule") travel as messages through a
//! per-CPU mailbox: remote CPUs post, the owning CPU drains at its next
//! scheduling decision. On hardware the post is paired with an IPI; here
//! the periodic tick bounds the delivery latency.

use alloc::collections::VecDeque;

use spin::Mutex;

/// Message to a specific CPU's scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpMessage {
    /// Runnable work arrived for this CPU; run a scheduling decision.
    Reschedule,
}

/// Per-CPU inbound message queue.
pub struct Mailbox {
    queue: Mutex<VecDeque<SmpMessage>>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Post a message. Callable from any CPU.
    pub fn post(&self, message: SmpMessage) {
        self.queue.lock().push_back(message);
    }

    /// Drain all pending messages. Only the owning CPU calls this.
    pub(crate) fn drain(&self) -> VecDeque<SmpMessage> {
        core::mem::take(&mut *self.queue.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
