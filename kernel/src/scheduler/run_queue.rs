//! Per-CPU run queues
//!
//! One FIFO ring per priority level. Selection takes the head of the
//! highest non-empty level; descheduled threads re-enter at the tail of
//! their level. Within a level this is plain round-robin: every queued
//! thread runs within one full rotation, which bounds starvation.
//!
//! Only ever touched under the scheduler lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::array;

use crate::thread::{Thread, ThreadId, ThreadPriority, ThreadState, PRIORITY_LEVELS};

pub struct RunQueue {
    queues: [VecDeque<Arc<Thread>>; PRIORITY_LEVELS],
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            queues: array::from_fn(|_| VecDeque::new()),
        }
    }

    /// Append a thread at the tail of its priority level.
    pub(crate) fn enqueue(&mut self, thread: Arc<Thread>) {
        debug_assert_eq!(thread.state(), ThreadState::Queued);
        debug_assert!(!thread.is_idle(), "idle threads are never enqueued");
        let level = thread.priority() as usize;
        self.queues[level].push_back(thread);
    }

    /// Pop the head of the highest non-empty priority level.
    pub(crate) fn dequeue(&mut self) -> Option<Arc<Thread>> {
        for queue in self.queues.iter_mut().rev() {
            if let Some(thread) = queue.pop_front() {
                return Some(thread);
            }
        }
        None
    }

    /// Is anything queued strictly above this priority? Equal priority
    /// does not preempt; it waits for the running thread's slice.
    pub(crate) fn has_priority_above(&self, priority: ThreadPriority) -> bool {
        self.queues
            .iter()
            .skip(priority as usize + 1)
            .any(|q| !q.is_empty())
    }

    /// Remove a specific thread (e.g. an external stop request against a
    /// queued thread).
    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Arc<Thread>> {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|t| t.id() == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}
