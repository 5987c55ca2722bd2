//! Thread state machine
//!
//! Scheduling-facing thread lifecycle. All transitions happen under the
//! scheduler lock; the atomic wrapper exists so other CPUs can *observe*
//! a state without taking the lock, never to mutate it lock-free.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Thread execution state, as the scheduler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created and eligible, not yet placed on a run queue
    Runnable = 0,

    /// Sitting on a run queue, waiting to be picked
    Queued = 1,

    /// Currently executing on exactly one CPU
    Running = 2,

    /// Suspended in a blocking wait until some condition holds
    Blocked = 3,

    /// Suspended by an external stop request, not schedulable
    Stopped = 4,

    /// Exit requested; still current on a CPU until switched away
    Dying = 5,

    /// Terminal. Set only after the thread is no longer current anywhere
    Dead = 6,
}

impl ThreadState {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Runnable),
            1 => Some(Self::Queued),
            2 => Some(Self::Running),
            3 => Some(Self::Blocked),
            4 => Some(Self::Stopped),
            5 => Some(Self::Dying),
            6 => Some(Self::Dead),
            _ => None,
        }
    }

    /// Can the scheduler pick this thread off a run queue?
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Queued)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Runnable => "Runnable",
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Blocked => "Blocked",
            Self::Stopped => "Stopped",
            Self::Dying => "Dying",
            Self::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// Atomic cell holding a [`ThreadState`].
pub struct AtomicThreadState {
    state: AtomicU8,
}

impl AtomicThreadState {
    pub const fn new(state: ThreadState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn load(&self) -> ThreadState {
        let value = self.state.load(Ordering::Acquire);
        ThreadState::from_raw(value).expect("corrupt thread state")
    }

    /// Store a new state, asserting the transition is legal.
    /// Caller must hold the scheduler lock.
    pub fn transition(&self, to: ThreadState) {
        let from = self.load();
        assert!(
            validate_transition(from, to),
            "illegal thread state transition {} -> {}",
            from,
            to
        );
        self.state.store(to as u8, Ordering::Release);
    }
}

impl fmt::Debug for AtomicThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.load())
    }
}

/// Legal scheduling-state transitions.
pub fn validate_transition(from: ThreadState, to: ThreadState) -> bool {
    use ThreadState::*;

    match (from, to) {
        // Enqueue a fresh or woken or continued thread
        (Runnable, Queued) => true,
        (Blocked, Queued) => true,
        (Stopped, Queued) => true,

        // Dispatch
        (Queued, Running) => true,

        // Preemption or voluntary yield
        (Running, Queued) => true,

        // Voluntary wait
        (Running, Blocked) => true,

        // External stop request
        (Runnable, Stopped) => true,
        (Queued, Stopped) => true,
        (Running, Stopped) => true,
        (Blocked, Stopped) => true,

        // Exit: only the running thread can start dying, and a dying
        // thread only finishes once it stopped being current
        (Running, Dying) => true,
        (Dying, Dead) => true,

        _ => false,
    }
}
