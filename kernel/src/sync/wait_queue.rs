//! Wait queues
//!
//! The blocking primitive the rest of the kernel builds on: a FIFO list of
//! threads waiting for some condition. Wakeups are handed to the scheduler
//! as unblock requests; the queue itself never touches thread state
//! directly.
//!
//! A wait has two halves. `begin_wait` registers the caller before the
//! thread blocks; a wake arriving in the window between registration and
//! the block is recorded on the thread and the block call returns without
//! sleeping, so no wakeup is ever lost to that window. `finish_wait` runs
//! after the thread is dispatched again and classifies the wakeup: removed
//! from the list by a waker means the condition fired; still on the list
//! means something else (a signal) ended the wait early.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::processor::ProcessorState;
use crate::scheduler::Scheduler;
use crate::thread::{Thread, ThreadId, WakeCause};

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The awaited condition was signalled.
    Woken,
    /// The wait was cut short (signal delivery); the condition may or may
    /// not hold and the caller must re-check before retrying.
    Interrupted,
}

/// FIFO queue of threads blocked on one condition.
pub struct WaitQueue {
    waiters: Mutex<VecDeque<ThreadId>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Register `thread` as a waiter. The caller blocks afterwards;
    /// between the two a waker may already pull the entry, in which case
    /// the wake is recorded on the thread and the block declines to sleep.
    pub fn begin_wait(&self, thread: &Thread) {
        self.waiters.lock().push_back(thread.id());
    }

    /// Classify the wakeup after the blocked thread has been dispatched
    /// again, and clear any leftover registration.
    pub fn finish_wait(&self, thread: &Thread) -> WaitResult {
        let still_registered = {
            let mut waiters = self.waiters.lock();
            match waiters.iter().position(|id| *id == thread.id()) {
                Some(pos) => {
                    waiters.remove(pos);
                    true
                }
                None => false,
            }
        };

        // A waker dequeues the entry before unblocking; an interrupting
        // signal leaves it in place. Either way the recorded cause has the
        // final word when present.
        match thread.take_wake_cause() {
            Some(WakeCause::Signal) => WaitResult::Interrupted,
            Some(WakeCause::Condition) => WaitResult::Woken,
            None if still_registered => WaitResult::Interrupted,
            None => WaitResult::Woken,
        }
    }

    /// Block the calling thread until woken. Composes `begin_wait`, the
    /// scheduler block and `finish_wait`; returns once this thread is
    /// running again.
    pub fn wait(&self, sched: &Scheduler, proc: &ProcessorState) -> WaitResult {
        let thread = proc
            .current_thread()
            .expect("wait with no current thread");
        self.begin_wait(&thread);
        sched.block_current(proc);
        self.finish_wait(&thread)
    }

    /// Wake the longest-waiting thread. Returns true if one was woken.
    /// `proc` is the calling CPU. A waiter that has not reached its block
    /// point yet still counts as woken: the wake is recorded on it and
    /// its block call returns immediately.
    pub fn wake_one(&self, sched: &Scheduler, proc: &ProcessorState) -> bool {
        loop {
            let id = match self.waiters.lock().pop_front() {
                Some(id) => id,
                None => return false,
            };
            // A stale entry (waiter already gone) is skipped, not fatal.
            if sched.deliver_wake(proc, id, WakeCause::Condition) {
                return true;
            }
        }
    }

    /// Wake every waiter. Returns how many threads were woken.
    pub fn wake_all(&self, sched: &Scheduler, proc: &ProcessorState) -> usize {
        let ids = core::mem::take(&mut *self.waiters.lock());
        ids.into_iter()
            .filter(|id| sched.deliver_wake(proc, *id, WakeCause::Condition))
            .count()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
