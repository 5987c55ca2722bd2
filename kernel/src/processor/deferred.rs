//! Deferred call pool
//!
//! Lets any context on a CPU, including interrupt handlers, queue a
//! closure to run later, outside interrupt and critical-section context.
//! Entries come from a fixed boot-time arena, so queueing never allocates a
//! slot; exhausting the arena means deferred-call discipline leaked entries
//! and is fatal. Each pool belongs to exactly one CPU and is never shared.
//!
//! Execution order is FIFO per CPU. Calls queued while the pool is draining
//! run in the same drain pass.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::array;

use spin::Mutex;

/// Slots per CPU. Boot-time constant; sized for worst-case IRQ bursts.
pub const DEFERRED_CALL_POOL_SIZE: usize = 32;

type DeferredHandler = Box<dyn FnOnce() + Send>;

/// Entry lifecycle: Free -> Queued -> Executing -> Free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Queued,
    Executing,
}

struct Slot {
    state: SlotState,
    handler: Option<DeferredHandler>,
}

struct PoolInner {
    /// The arena. Slots are addressed by index and never move.
    slots: [Slot; DEFERRED_CALL_POOL_SIZE],
    /// Indices of queued slots, FIFO.
    queue: VecDeque<usize>,
    /// Indices of free slots.
    free: Vec<usize>,
}

/// Per-CPU pool of deferred call entries.
pub struct DeferredCallPool {
    inner: Mutex<PoolInner>,
}

impl DeferredCallPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: array::from_fn(|_| Slot {
                    state: SlotState::Free,
                    handler: None,
                }),
                queue: VecDeque::with_capacity(DEFERRED_CALL_POOL_SIZE),
                free: (0..DEFERRED_CALL_POOL_SIZE).rev().collect(),
            }),
        }
    }

    /// Number of entries waiting to execute.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Queue a callback. Callers run with interrupts disabled on the owning
    /// CPU, which is what makes this safe from interrupt context.
    ///
    /// Fatal if the pool is exhausted.
    pub(crate) fn queue(&self, handler: DeferredHandler) {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => panic!("deferred call pool exhausted"),
        };
        let slot = &mut inner.slots[index];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.state = SlotState::Queued;
        slot.handler = Some(handler);
        inner.queue.push_back(index);
    }

    /// Drain the queue in FIFO order, returning each entry to the free list
    /// after its handler ran. Handlers may queue further deferred calls;
    /// those are picked up by the same loop.
    ///
    /// Only called from the outermost critical-section exit, with the IRQ
    /// nesting counter at zero.
    pub(crate) fn execute_pending(&self) {
        loop {
            let (index, handler) = {
                let mut inner = self.inner.lock();
                let index = match inner.queue.pop_front() {
                    Some(index) => index,
                    None => break,
                };
                let slot = &mut inner.slots[index];
                debug_assert_eq!(slot.state, SlotState::Queued);
                slot.state = SlotState::Executing;
                let handler = slot.handler.take().expect("queued slot without handler");
                (index, handler)
            };

            // Run without holding the pool lock so the handler can queue
            // more deferred calls.
            handler();

            let mut inner = self.inner.lock();
            let slot = &mut inner.slots[index];
            debug_assert_eq!(slot.state, SlotState::Executing);
            slot.state = SlotState::Free;
            inner.free.push(index);
        }
    }
}
