//! Thread scheduling metadata
//!
//! The scheduler-facing slice of a thread: state, priority, time
//! accounting, saved critical depth and the trap-frame chain head. Process
//! semantics (address space, fds, signals policy) belong to the external
//! process manager and are not represented here.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

use super::state::{AtomicThreadState, ThreadState};
use crate::arch::{Context, CpuId};
use crate::processor::trap::{PreviousMode, TrapFrame};

/// Thread ID type
pub type ThreadId = u64;

/// Thread priority levels. Higher value wins; equal values round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadPriority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

/// Number of distinct priority levels (one run queue each).
pub const PRIORITY_LEVELS: usize = 4;

impl ThreadPriority {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            _ => None,
        }
    }

    /// Time slice granted per dispatch, in timer ticks.
    pub fn time_slice_ticks(self) -> u32 {
        match self {
            Self::Idle => 1,
            Self::Low => 2,
            Self::Normal => 4,
            Self::High => 8,
        }
    }
}

bitflags! {
    /// Per-thread flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Per-CPU idle thread; never enqueued, dispatched as fallback only
        const IDLE = 1 << 0;
        /// Has never been dispatched; the first switch takes the
        /// fresh-entry path instead of a normal resume
        const FIRST_DISPATCH = 1 << 1;
    }
}

/// Why a blocked thread was made runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeCause {
    /// The awaited condition was satisfied
    Condition = 1,
    /// Interrupted (e.g. pending signal); the wait must not report success
    Signal = 2,
}

/// A schedulable thread, as the scheduler core sees it.
///
/// Created by the external thread lifecycle manager, handed to
/// `Scheduler::add_thread`. State transitions happen only under the
/// scheduler lock; the atomic fields exist for lock-free observation and
/// for same-CPU bookkeeping paths (tick accounting, trap linkage).
#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    name: &'static str,
    priority: ThreadPriority,
    state: AtomicThreadState,
    flags: AtomicU8,

    /// Critical-section depth this thread held when last switched out;
    /// restored verbatim when it is switched back in.
    saved_critical: AtomicU32,

    /// Remaining timer ticks in the current time slice.
    time_slice: AtomicU32,

    ticks_in_kernel: AtomicU64,
    ticks_in_user: AtomicU64,
    last_scheduled: AtomicU64,

    /// Head of the per-thread trap frame chain (innermost trap).
    /// Frames live on the interrupt path's stack, never on the heap.
    current_trap: AtomicPtr<TrapFrame>,
    previous_mode: AtomicU8,

    /// Set by whoever unblocks this thread, consumed once on resume.
    wake_cause: AtomicU8,

    /// A wake was delivered after wait registration but before the thread
    /// reached its block point; the block path consumes this and declines
    /// to sleep.
    wake_pending: AtomicBool,

    /// CPU whose run queues this thread lives on.
    home_cpu: AtomicU32,

    context: Context,
}

impl Thread {
    pub fn new(id: ThreadId, name: &'static str, priority: ThreadPriority) -> Self {
        Self {
            id,
            name,
            priority,
            state: AtomicThreadState::new(ThreadState::Runnable),
            flags: AtomicU8::new(ThreadFlags::FIRST_DISPATCH.bits()),
            saved_critical: AtomicU32::new(0),
            time_slice: AtomicU32::new(priority.time_slice_ticks()),
            ticks_in_kernel: AtomicU64::new(0),
            ticks_in_user: AtomicU64::new(0),
            last_scheduled: AtomicU64::new(0),
            current_trap: AtomicPtr::new(core::ptr::null_mut()),
            previous_mode: AtomicU8::new(PreviousMode::Kernel as u8),
            wake_cause: AtomicU8::new(0),
            wake_pending: AtomicBool::new(false),
            home_cpu: AtomicU32::new(0),
            context: Context::new(),
        }
    }

    /// Build the per-CPU idle thread. Idle threads are treated as
    /// perpetually queued on their CPU and never enter a run queue.
    pub fn new_idle(id: ThreadId, cpu: CpuId) -> Self {
        let thread = Self::new(id, "idle", ThreadPriority::Idle);
        thread.flags.fetch_or(ThreadFlags::IDLE.bits(), Ordering::Relaxed);
        thread.home_cpu.store(cpu.0, Ordering::Relaxed);
        thread.state.transition(ThreadState::Queued);
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> ThreadPriority {
        self.priority
    }

    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    /// Caller must hold the scheduler lock.
    pub(crate) fn set_state(&self, to: ThreadState) {
        self.state.transition(to);
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    /// Consume the first-dispatch marker. Returns true exactly once.
    pub(crate) fn take_first_dispatch(&self) -> bool {
        let old = self
            .flags
            .fetch_and(!ThreadFlags::FIRST_DISPATCH.bits(), Ordering::AcqRel);
        ThreadFlags::from_bits_truncate(old).contains(ThreadFlags::FIRST_DISPATCH)
    }

    pub fn saved_critical(&self) -> u32 {
        self.saved_critical.load(Ordering::Acquire)
    }

    pub(crate) fn set_saved_critical(&self, depth: u32) {
        self.saved_critical.store(depth, Ordering::Release);
    }

    pub fn home_cpu(&self) -> CpuId {
        CpuId(self.home_cpu.load(Ordering::Acquire))
    }

    pub(crate) fn set_home_cpu(&self, cpu: CpuId) {
        self.home_cpu.store(cpu.0, Ordering::Release);
    }

    // ── Time slice ──────────────────────────────────────────────────────

    pub fn time_slice_remaining(&self) -> u32 {
        self.time_slice.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_time_slice(&self) {
        self.time_slice
            .store(self.priority.time_slice_ticks(), Ordering::Relaxed);
    }

    /// Burn one tick off the slice. Returns true once the slice is spent.
    pub(crate) fn consume_tick(&self) -> bool {
        let remaining = self.time_slice.load(Ordering::Relaxed);
        if remaining <= 1 {
            self.time_slice.store(0, Ordering::Relaxed);
            true
        } else {
            self.time_slice.store(remaining - 1, Ordering::Relaxed);
            false
        }
    }

    // ── Time accounting ─────────────────────────────────────────────────

    pub fn ticks_in_kernel(&self) -> u64 {
        self.ticks_in_kernel.load(Ordering::Relaxed)
    }

    pub fn ticks_in_user(&self) -> u64 {
        self.ticks_in_user.load(Ordering::Relaxed)
    }

    pub(crate) fn accrue_ticks(&self, mode: PreviousMode, ticks: u64) {
        let bucket = match mode {
            PreviousMode::Kernel => &self.ticks_in_kernel,
            PreviousMode::User => &self.ticks_in_user,
        };
        bucket.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn last_scheduled(&self) -> u64 {
        self.last_scheduled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_scheduled(&self, now: u64) {
        self.last_scheduled.store(now, Ordering::Relaxed);
    }

    // ── Trap linkage ────────────────────────────────────────────────────

    pub(crate) fn current_trap(&self) -> *mut TrapFrame {
        self.current_trap.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_trap(&self, trap: *mut TrapFrame) {
        self.current_trap.store(trap, Ordering::Release);
    }

    pub fn previous_mode(&self) -> PreviousMode {
        PreviousMode::from_raw(self.previous_mode.load(Ordering::Acquire))
    }

    /// Returns the mode that was current before this store.
    pub(crate) fn set_previous_mode(&self, mode: PreviousMode) -> PreviousMode {
        PreviousMode::from_raw(self.previous_mode.swap(mode as u8, Ordering::AcqRel))
    }

    // ── Wakeup plumbing ─────────────────────────────────────────────────

    pub(crate) fn set_wake_cause(&self, cause: WakeCause) {
        self.wake_cause.store(cause as u8, Ordering::Release);
    }

    /// Consume the recorded wake cause, if any.
    pub fn take_wake_cause(&self) -> Option<WakeCause> {
        match self.wake_cause.swap(0, Ordering::AcqRel) {
            1 => Some(WakeCause::Condition),
            2 => Some(WakeCause::Signal),
            _ => None,
        }
    }

    pub(crate) fn set_wake_pending(&self) {
        self.wake_pending.store(true, Ordering::Release);
    }

    /// Consume the early-wake marker. Returns true exactly once per
    /// delivered early wake.
    pub(crate) fn take_wake_pending(&self) -> bool {
        self.wake_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }
}
