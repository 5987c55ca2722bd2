//! Scheduler core
//!
//! Owns the mapping from runnable threads to CPUs and the mechanics of
//! switching between them. One scheduler instance serves all CPUs: each
//! CPU has its own run queues, but a single scheduler lock totally orders
//! every cross-thread state transition in the system.
//!
//! Locking discipline: thread state transitions and run queue mutation
//! happen only under the scheduler lock, and the lock is only ever taken
//! with interrupts masked on the executing CPU, so a timer interrupt can
//! never spin on a lock its own interrupted context holds. Cross-thread
//! operations therefore take the caller's `ProcessorState`. Per-CPU
//! counters (`in_critical`, `in_irq`) are owned by their CPU and never
//! touched remotely; cross-CPU wakeups go through the per-CPU mailbox.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use log::{debug, info, trace};
use spin::{Mutex, MutexGuard};

use super::run_queue::RunQueue;
use crate::arch::{Cpu, CpuId};
use crate::processor::{ProcessorRegistry, ProcessorState, SmpMessage};
use crate::thread::{Thread, ThreadId, ThreadState, WakeCause};

/// Everything guarded by the scheduler lock.
struct SchedState {
    /// Run queues, indexed by CPU id.
    queues: Vec<RunQueue>,
    /// Every live thread the scheduler knows about. Dead threads are
    /// removed here once their final switch-away completes.
    threads: HashMap<ThreadId, Arc<Thread>>,
}

/// The system-wide scheduler.
pub struct Scheduler {
    registry: ProcessorRegistry,
    state: Mutex<SchedState>,
    initialized: AtomicBool,
    next_thread_id: AtomicU64,
    total_switches: AtomicU64,
    total_ticks: AtomicU64,
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub total_context_switches: u64,
    pub total_ticks: u64,
    pub online_cpus: usize,
    pub live_threads: usize,
    pub queued_threads: usize,
}

impl Scheduler {
    /// Bring the scheduler up for `cpu_count` CPUs: build the processor
    /// registry, wire every CPU to this scheduler, and give each its idle
    /// thread. Fatal if `cpu_count` is zero.
    ///
    /// Returns a leaked `&'static` because processors hold a back
    /// reference for the async-invocation path; the scheduler lives for
    /// the lifetime of the machine anyway.
    pub fn bring_up(cpu_count: usize) -> &'static Scheduler {
        let scheduler: &'static Scheduler = Box::leak(Box::new(Scheduler {
            registry: ProcessorRegistry::new(cpu_count),
            state: Mutex::new(SchedState {
                queues: (0..cpu_count).map(|_| RunQueue::new()).collect(),
                threads: HashMap::new(),
            }),
            initialized: AtomicBool::new(false),
            next_thread_id: AtomicU64::new(1),
            total_switches: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
        }));

        for proc in scheduler.registry.iter() {
            let cpu = proc.id();
            let idle = Arc::new(Thread::new_idle(scheduler.allocate_thread_id(), cpu));
            proc.set_idle_thread(idle);
            proc.attach_scheduler(scheduler);
            scheduler.registry.mark_online(cpu);
            debug!("{} online", cpu);
        }

        scheduler.initialized.store(true, Ordering::Release);
        info!("scheduler online, {} CPUs", cpu_count);
        scheduler
    }

    pub fn allocate_thread_id(&self) -> ThreadId {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn processor(&self, id: CpuId) -> &ProcessorState {
        self.registry.get(id)
    }

    // ── Thread intake ───────────────────────────────────────────────────

    /// Register a freshly created thread and queue it on `home`. `proc` is
    /// the CPU this call executes on.
    pub fn add_thread(
        &self,
        proc: &ProcessorState,
        thread: Thread,
        home: CpuId,
    ) -> Arc<Thread> {
        assert!(!thread.is_idle(), "idle threads are created at bring-up");
        assert_eq!(thread.state(), ThreadState::Runnable);
        thread.set_home_cpu(home);

        let thread = Arc::new(thread);
        let irq_state = proc.cpu().disable_interrupts();
        {
            let mut st = self.state.lock();
            st.threads.insert(thread.id(), thread.clone());
            thread.set_state(ThreadState::Queued);
            st.queues[home.as_usize()].enqueue(thread.clone());
        }
        self.notify_cpu(home);
        proc.cpu().restore_interrupts(irq_state);

        debug!("thread {} '{}' queued on {}", thread.id(), thread.name(), home);
        thread
    }

    /// Tell a CPU it has new runnable work, if it is idling. Message
    /// passing only; the owner drains at its next scheduling decision.
    /// Called with interrupts masked on the executing CPU.
    fn notify_cpu(&self, cpu: CpuId) {
        let proc = self.registry.get(cpu);
        let idling = proc.current_thread().map_or(true, |t| t.is_idle());
        if idling {
            proc.mailbox().post(SmpMessage::Reschedule);
        }
    }

    // ── Timer path ──────────────────────────────────────────────────────

    /// Periodic tick for one CPU: account the current thread's time, burn
    /// its slice, and decide whether a reschedule is due. Inside an IRQ or
    /// a critical section only the async flag is set; the reschedule then
    /// runs at the next boundary via `check_invoke_scheduler`.
    pub fn timer_tick(&self, proc: &ProcessorState) {
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
        let irq_state = proc.cpu().disable_interrupts();

        let mut want_resched = proc
            .mailbox()
            .drain()
            .iter()
            .any(|m| *m == SmpMessage::Reschedule);

        let current = match proc.current_thread() {
            Some(current) => current,
            None => {
                // Nothing dispatched yet on this CPU; get something going.
                if proc.in_irq() == 0 && proc.in_critical() == 0 {
                    self.schedule_on(proc);
                } else {
                    proc.set_invoke_scheduler_async();
                }
                proc.cpu().restore_interrupts(irq_state);
                return;
            }
        };

        // A tick arriving through the trap path has already been accounted
        // at the trap boundary; accrue here only for tick sources that
        // bypass it.
        if current.current_trap().is_null() {
            current.accrue_ticks(current.previous_mode(), 1);
        }
        if current.consume_tick() {
            want_resched = true;
        }

        {
            let st = self.state.lock();
            let queue = &st.queues[proc.id().as_usize()];
            if queue.has_priority_above(current.priority()) {
                want_resched = true;
            }
            if current.is_idle() && !queue.is_empty() {
                want_resched = true;
            }
        }

        if want_resched {
            if proc.in_irq() > 0 || proc.in_critical() > 0 {
                proc.set_invoke_scheduler_async();
            } else {
                self.schedule_on(proc);
            }
        }
        proc.cpu().restore_interrupts(irq_state);
    }

    /// Run the scheduling decision that could not happen at request time.
    /// Reached only through `check_invoke_scheduler`, which has already
    /// verified the invariants.
    pub fn invoke_async(&self, proc: &ProcessorState) {
        assert!(
            self.initialized.load(Ordering::Acquire),
            "scheduler invoked before initialization finished"
        );
        trace!("async scheduler invocation on {}", proc.id());
        self.schedule_on(proc);
    }

    // ── Voluntary transitions ───────────────────────────────────────────

    /// Give up the CPU; the current thread re-enters its level's tail.
    pub fn yield_now(&self, proc: &ProcessorState) {
        self.schedule_on(proc);
    }

    /// Block the current thread. The caller has already put it on some
    /// wait structure; the scheduler only stops selecting it until an
    /// unblock arrives. A wake delivered between the wait registration and
    /// this call is consumed here and the thread does not sleep at all.
    pub fn block_current(&self, proc: &ProcessorState) {
        let current = proc
            .current_thread()
            .expect("block with no current thread");
        assert!(!current.is_idle(), "the idle thread cannot block");

        let irq_state = proc.cpu().disable_interrupts();
        let blocked = {
            let _st = self.state.lock();
            if current.take_wake_pending() {
                false
            } else {
                current.set_state(ThreadState::Blocked);
                true
            }
        };
        proc.cpu().restore_interrupts(irq_state);

        if !blocked {
            trace!("thread {} wake arrived before it slept", current.id());
            return;
        }
        trace!("thread {} blocked on {}", current.id(), proc.id());
        self.schedule_on(proc);
    }

    /// Terminate the current thread. It becomes Dying now and Dead once
    /// the switch-away completes (`enter_current` on the next thread).
    pub fn exit_current(&self, proc: &ProcessorState) {
        let current = proc
            .current_thread()
            .expect("exit with no current thread");
        assert!(!current.is_idle(), "the idle thread cannot exit");
        let irq_state = proc.cpu().disable_interrupts();
        {
            let _st = self.state.lock();
            current.set_state(ThreadState::Dying);
        }
        proc.cpu().restore_interrupts(irq_state);
        debug!("thread {} dying on {}", current.id(), proc.id());
        self.schedule_on(proc);
    }

    /// Stop the current thread (external stop request delivered on its own
    /// CPU). It stays off the queues until `continue_thread`.
    pub fn stop_current(&self, proc: &ProcessorState) {
        let current = proc
            .current_thread()
            .expect("stop with no current thread");
        assert!(!current.is_idle(), "the idle thread cannot stop");
        let irq_state = proc.cpu().disable_interrupts();
        {
            let _st = self.state.lock();
            current.set_state(ThreadState::Stopped);
        }
        proc.cpu().restore_interrupts(irq_state);
        self.schedule_on(proc);
    }

    // ── Cross-thread transitions ────────────────────────────────────────

    /// Make a blocked thread runnable again, recording why it woke.
    /// Returns false if the thread is unknown or not blocked. `proc` is
    /// the calling CPU.
    pub fn unblock(&self, proc: &ProcessorState, id: ThreadId, cause: WakeCause) -> bool {
        let irq_state = proc.cpu().disable_interrupts();
        let home = {
            let mut st = self.state.lock();
            match st.threads.get(&id).cloned() {
                Some(thread) if thread.state() == ThreadState::Blocked => {
                    Some(Self::wake_locked(&mut st, &thread, cause))
                }
                _ => None,
            }
        };
        if let Some(home) = home {
            trace!("thread {} unblocked -> {}", id, home);
            self.notify_cpu(home);
        }
        proc.cpu().restore_interrupts(irq_state);
        home.is_some()
    }

    /// Wake the thread behind a wait registration. Unlike `unblock`, a
    /// target that has not reached its block point yet gets the wake
    /// recorded on it instead; the block path consumes the record and
    /// declines to sleep, so a wake can never fall into the gap between
    /// wait registration and the block.
    pub fn deliver_wake(&self, proc: &ProcessorState, id: ThreadId, cause: WakeCause) -> bool {
        let irq_state = proc.cpu().disable_interrupts();
        let outcome = {
            let mut st = self.state.lock();
            match st.threads.get(&id).cloned() {
                Some(thread) => match thread.state() {
                    ThreadState::Blocked => {
                        Some(Some(Self::wake_locked(&mut st, &thread, cause)))
                    }
                    ThreadState::Running | ThreadState::Queued | ThreadState::Runnable => {
                        thread.set_wake_cause(cause);
                        thread.set_wake_pending();
                        Some(None)
                    }
                    _ => None,
                },
                None => None,
            }
        };
        if let Some(Some(home)) = outcome {
            trace!("thread {} unblocked -> {}", id, home);
            self.notify_cpu(home);
        }
        proc.cpu().restore_interrupts(irq_state);
        outcome.is_some()
    }

    /// Interrupt a blocking wait (e.g. signal delivery). The woken thread
    /// sees a distinct interrupted result instead of a normal wakeup.
    pub fn interrupt_thread(&self, proc: &ProcessorState, id: ThreadId) -> bool {
        self.deliver_wake(proc, id, WakeCause::Signal)
    }

    /// Blocked -> Queued under the scheduler lock. Returns the home CPU to
    /// notify once the lock is dropped.
    fn wake_locked(st: &mut SchedState, thread: &Arc<Thread>, cause: WakeCause) -> CpuId {
        thread.set_wake_cause(cause);
        thread.set_state(ThreadState::Queued);
        let home = thread.home_cpu();
        st.queues[home.as_usize()].enqueue(thread.clone());
        home
    }

    /// Stop a thread that is not currently running: queued threads leave
    /// their run queue, blocked threads leave the blocked state. A Running
    /// thread must be stopped from its own CPU via `stop_current`.
    pub fn stop_thread(&self, proc: &ProcessorState, id: ThreadId) -> bool {
        let irq_state = proc.cpu().disable_interrupts();
        let stopped = {
            let mut st = self.state.lock();
            match st.threads.get(&id).cloned() {
                Some(thread) => match thread.state() {
                    ThreadState::Queued => {
                        let home = thread.home_cpu();
                        st.queues[home.as_usize()]
                            .remove(id)
                            .expect("queued thread missing from its run queue");
                        thread.set_state(ThreadState::Stopped);
                        true
                    }
                    ThreadState::Runnable | ThreadState::Blocked => {
                        thread.set_state(ThreadState::Stopped);
                        true
                    }
                    _ => false,
                },
                None => false,
            }
        };
        proc.cpu().restore_interrupts(irq_state);
        stopped
    }

    /// Resume a stopped thread.
    pub fn continue_thread(&self, proc: &ProcessorState, id: ThreadId) -> bool {
        let irq_state = proc.cpu().disable_interrupts();
        let home = {
            let mut st = self.state.lock();
            match st.threads.get(&id).cloned() {
                Some(thread) if thread.state() == ThreadState::Stopped => {
                    thread.set_state(ThreadState::Queued);
                    let home = thread.home_cpu();
                    st.queues[home.as_usize()].enqueue(thread);
                    Some(home)
                }
                _ => None,
            }
        };
        if let Some(home) = home {
            self.notify_cpu(home);
        }
        proc.cpu().restore_interrupts(irq_state);
        home.is_some()
    }

    // ── The scheduling decision ─────────────────────────────────────────

    /// Pick and dispatch the next thread for `proc`. Never callable from
    /// interrupt context; a nonzero critical depth is legal here (a thread
    /// may block mid-critical-section) and is saved/restored across the
    /// switch.
    fn schedule_on(&self, proc: &ProcessorState) {
        assert_eq!(
            proc.in_irq(),
            0,
            "scheduler entered from interrupt context"
        );

        let irq_state = proc.cpu().disable_interrupts();
        let now = proc.cpu().timestamp();
        let mut st = self.state.lock();

        // Any messages still in the box are satisfied by this decision.
        let _ = proc.mailbox().drain();

        let old = proc.current_thread();

        let next = match st.queues[proc.id().as_usize()].dequeue() {
            Some(next) => next,
            None => match &old {
                // Nothing else runnable; the incumbent keeps the CPU.
                Some(current) if current.state() == ThreadState::Running => {
                    current.reset_time_slice();
                    drop(st);
                    proc.cpu().restore_interrupts(irq_state);
                    return;
                }
                // Incumbent went away (blocked/dying/stopped) or the CPU
                // is fresh: fall back to the idle thread.
                _ => proc.idle_thread().clone(),
            },
        };
        debug_assert!(!old.as_ref().is_some_and(|o| Arc::ptr_eq(o, &next)));

        let first = self.context_switch(proc, &mut st, old.as_deref(), &next, now);

        // From here on we are logically the incoming thread.
        self.enter_current(&mut st, old.as_deref());
        if first {
            Self::leave_on_first_switch(st);
        } else {
            drop(st);
        }

        proc.restore_critical(next.saved_critical());
        proc.cpu().restore_interrupts(irq_state);
    }

    /// Switch bookkeeping: park the outgoing thread, save its critical
    /// depth, install the incoming thread and hand the register state to
    /// the arch backend. Returns true when this is the incoming thread's
    /// very first dispatch.
    fn context_switch(
        &self,
        proc: &ProcessorState,
        st: &mut SchedState,
        old: Option<&Thread>,
        next: &Arc<Thread>,
        now: u64,
    ) -> bool {
        if let Some(old) = old {
            if old.state() == ThreadState::Running {
                old.set_state(ThreadState::Queued);
                if !old.is_idle() {
                    let arc = st
                        .threads
                        .get(&old.id())
                        .expect("running thread missing from registry")
                        .clone();
                    st.queues[proc.id().as_usize()].enqueue(arc);
                }
            }
            old.set_saved_critical(proc.in_critical());
        }

        next.set_state(ThreadState::Running);
        next.reset_time_slice();
        next.set_last_scheduled(now);
        proc.set_current_thread(next.clone());
        self.total_switches.fetch_add(1, Ordering::Relaxed);
        trace!(
            "{}: switch {} -> {}",
            proc.id(),
            old.map(Thread::id).unwrap_or(0),
            next.id()
        );

        let first = next.take_first_dispatch();
        if let Some(old) = old {
            proc.cpu().switch_context(old.context(), next.context());
        }
        first
    }

    /// Bookkeeping on arrival: the previous thread is no longer current
    /// here, so a Dying one can now complete its death and leave the
    /// registry.
    fn enter_current(&self, st: &mut SchedState, previous: Option<&Thread>) {
        if let Some(prev) = previous {
            if prev.state() == ThreadState::Dying {
                prev.set_state(ThreadState::Dead);
                st.threads.remove(&prev.id());
                debug!("thread {} dead", prev.id());
            }
        }
    }

    /// First-ever dispatch of a thread: there is no outer switch frame to
    /// unwind through, so the scheduler lock is released explicitly here.
    /// Deliberately does not touch the interrupt flag; the dispatch tail
    /// decides when interrupts come back, so the switch cannot be
    /// re-entered from its own tail.
    fn leave_on_first_switch(guard: MutexGuard<'_, SchedState>) {
        drop(guard);
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn thread(&self, proc: &ProcessorState, id: ThreadId) -> Option<Arc<Thread>> {
        let irq_state = proc.cpu().disable_interrupts();
        let found = self.state.lock().threads.get(&id).cloned();
        proc.cpu().restore_interrupts(irq_state);
        found
    }

    pub fn stats(&self, proc: &ProcessorState) -> SchedulerStats {
        let irq_state = proc.cpu().disable_interrupts();
        let (live_threads, queued_threads) = {
            let st = self.state.lock();
            (st.threads.len(), st.queues.iter().map(RunQueue::len).sum())
        };
        proc.cpu().restore_interrupts(irq_state);
        SchedulerStats {
            total_context_switches: self.total_switches.load(Ordering::Relaxed),
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            online_cpus: self.registry.online(),
            live_threads,
            queued_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TrapFrame;
    use crate::thread::ThreadPriority;
    use alloc::vec;
    use proptest::prelude::*;

    fn tick(sched: &Scheduler, proc: &ProcessorState) {
        proc.cpu().advance(1);
        sched.timer_tick(proc);
    }

    fn current_id(proc: &ProcessorState) -> ThreadId {
        proc.current_thread().unwrap().id()
    }

    #[test]
    fn test_bring_up_wires_every_cpu() {
        let sched = Scheduler::bring_up(2);
        assert_eq!(sched.processors().online(), 2);
        for proc in sched.processors().iter() {
            assert!(proc.idle_thread().is_idle());
            assert!(proc.scheduler().is_some());
            assert!(proc.current_thread().is_none());
        }
        let stats = sched.stats(sched.processor(CpuId(0)));
        assert_eq!(stats.online_cpus, 2);
        assert_eq!(stats.live_threads, 0);
    }

    #[test]
    fn test_first_dispatch_prefers_highest_priority() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));

        sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "low", ThreadPriority::Low),
            CpuId(0),
        );
        let high = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "high", ThreadPriority::High),
            CpuId(0),
        );
        sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "normal", ThreadPriority::Normal),
            CpuId(0),
        );

        tick(sched, proc);
        assert_eq!(current_id(proc), high.id());
        assert_eq!(high.state(), ThreadState::Running);
    }

    #[test]
    fn test_idle_runs_when_nothing_is_queued() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));

        tick(sched, proc);
        assert!(proc.current_thread().unwrap().is_idle());

        // New work displaces the idle thread at the next tick.
        let worker = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "worker", ThreadPriority::Normal),
            CpuId(0),
        );
        assert!(!proc.mailbox().is_empty());
        tick(sched, proc);
        assert_eq!(current_id(proc), worker.id());
    }

    #[test]
    fn test_yield_rotates_equal_priority() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        let b = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "b", ThreadPriority::Normal),
            CpuId(0),
        );

        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());
        sched.yield_now(proc);
        assert_eq!(current_id(proc), b.id());
        assert_eq!(a.state(), ThreadState::Queued);
        sched.yield_now(proc);
        assert_eq!(current_id(proc), a.id());
    }

    #[test]
    fn test_block_unblock_and_slice_boundary_preemption() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::High),
            CpuId(0),
        );
        let b = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "b", ThreadPriority::Normal),
            CpuId(0),
        );
        let c = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "c", ThreadPriority::Normal),
            CpuId(0),
        );

        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        sched.block_current(proc);
        assert_eq!(a.state(), ThreadState::Blocked);
        assert_eq!(current_id(proc), b.id());

        sched.block_current(proc);
        assert_eq!(current_id(proc), c.id());

        // B becomes runnable again while C runs. Same priority, so C
        // keeps the CPU until its slice runs out at a tick boundary.
        assert!(sched.unblock(proc, b.id(), WakeCause::Condition));
        assert_eq!(b.state(), ThreadState::Queued);
        for _ in 0..3 {
            tick(sched, proc);
            assert_eq!(current_id(proc), c.id());
        }
        tick(sched, proc);
        assert_eq!(current_id(proc), b.id());
        assert_eq!(c.state(), ThreadState::Queued);
    }

    #[test]
    fn test_higher_priority_wakeup_preempts_at_next_tick() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let high = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "high", ThreadPriority::High),
            CpuId(0),
        );
        let low = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "low", ThreadPriority::Low),
            CpuId(0),
        );

        tick(sched, proc);
        assert_eq!(current_id(proc), high.id());
        sched.block_current(proc);
        assert_eq!(current_id(proc), low.id());

        assert!(sched.unblock(proc, high.id(), WakeCause::Condition));
        tick(sched, proc);
        assert_eq!(current_id(proc), high.id());
        assert_eq!(high.take_wake_cause(), Some(WakeCause::Condition));
    }

    #[test]
    fn test_unblock_is_tolerant() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        // Not blocked, and an id nobody owns.
        assert!(!sched.unblock(proc, a.id(), WakeCause::Condition));
        assert!(!sched.unblock(proc, 9999, WakeCause::Condition));
    }

    #[test]
    fn test_interrupted_wait_records_signal_cause() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        tick(sched, proc);
        sched.block_current(proc);
        assert!(sched.interrupt_thread(proc, a.id()));
        assert_eq!(a.state(), ThreadState::Queued);
        assert_eq!(a.take_wake_cause(), Some(WakeCause::Signal));
    }

    #[test]
    fn test_wake_before_block_is_recorded_not_lost() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        // The wake lands while A is still running towards its block point.
        assert!(sched.deliver_wake(proc, a.id(), WakeCause::Condition));
        sched.block_current(proc);

        // A never actually slept.
        assert_eq!(a.state(), ThreadState::Running);
        assert_eq!(current_id(proc), a.id());
        assert_eq!(a.take_wake_cause(), Some(WakeCause::Condition));

        // With the early wake consumed, the next block is a real one.
        sched.block_current(proc);
        assert_eq!(a.state(), ThreadState::Blocked);
    }

    #[test]
    fn test_exit_reaps_after_switch_away() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        let id = a.id();
        tick(sched, proc);
        assert_eq!(sched.stats(proc).live_threads, 1);

        sched.exit_current(proc);
        assert_eq!(a.state(), ThreadState::Dead);
        assert!(sched.thread(proc, id).is_none());
        assert_eq!(sched.stats(proc).live_threads, 0);
        assert!(proc.current_thread().unwrap().is_idle());
    }

    #[test]
    fn test_stop_and_continue() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        let b = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "b", ThreadPriority::Normal),
            CpuId(0),
        );

        // Stopping a queued thread pulls it off the run queue.
        assert!(sched.stop_thread(proc, b.id()));
        assert_eq!(b.state(), ThreadState::Stopped);

        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());
        tick(sched, proc);
        // B stays off-queue while stopped; A keeps running past its slice.
        for _ in 0..4 {
            tick(sched, proc);
        }
        assert_eq!(current_id(proc), a.id());

        assert!(sched.continue_thread(proc, b.id()));
        assert_eq!(b.state(), ThreadState::Queued);
        for _ in 0..4 {
            tick(sched, proc);
        }
        assert_eq!(current_id(proc), b.id());
    }

    #[test]
    fn test_critical_section_defers_preemption() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        let b = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "b", ThreadPriority::Normal),
            CpuId(0),
        );

        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        proc.enter_critical();
        // The slice expires inside the critical section; the switch is
        // requested but must not happen yet.
        for _ in 0..6 {
            tick(sched, proc);
        }
        assert_eq!(current_id(proc), a.id());
        assert!(proc.invoke_scheduler_async_pending());

        // Leaving the outermost critical section runs the pending decision.
        proc.leave_critical();
        assert_eq!(current_id(proc), b.id());
        assert!(!proc.invoke_scheduler_async_pending());
    }

    #[test]
    fn test_tick_in_irq_defers_until_trap_exit() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        let b = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "b", ThreadPriority::Normal),
            CpuId(0),
        );

        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        // The slice expires while the timer handler is on the stack: only
        // the async flag may be set, the switch waits for the trap exit.
        let irq_state = proc.cpu().disable_interrupts();
        let mut frame = TrapFrame::new(false);
        proc.enter_trap(&mut frame, true);
        for _ in 0..4 {
            tick(sched, proc);
        }
        assert_eq!(current_id(proc), a.id());
        assert!(proc.invoke_scheduler_async_pending());

        proc.exit_trap(&mut frame);
        proc.cpu().restore_interrupts(irq_state);
        assert_eq!(current_id(proc), b.id());
        assert!(!proc.invoke_scheduler_async_pending());
    }

    #[test]
    fn test_trap_delivered_tick_accounts_once() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        // One tick elapses and arrives through the trap path: the trap
        // boundary accounts it, the tick path must not add a second one.
        let before = a.ticks_in_kernel() + a.ticks_in_user();
        proc.cpu().advance(1);
        let irq_state = proc.cpu().disable_interrupts();
        let mut frame = TrapFrame::new(false);
        proc.enter_trap(&mut frame, true);
        sched.timer_tick(proc);
        proc.exit_trap(&mut frame);
        proc.cpu().restore_interrupts(irq_state);

        assert_eq!(a.ticks_in_kernel() + a.ticks_in_user(), before + 1);
    }

    #[test]
    fn test_cross_thread_ops_preserve_interrupt_flag() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        assert!(proc.cpu().interrupts_enabled());

        tick(sched, proc);
        sched.block_current(proc);
        assert!(proc.cpu().interrupts_enabled());

        // Callable with interrupts already masked; the mask nests.
        let irq_state = proc.cpu().disable_interrupts();
        assert!(sched.unblock(proc, a.id(), WakeCause::Condition));
        assert!(!proc.cpu().interrupts_enabled());
        proc.cpu().restore_interrupts(irq_state);
        assert!(proc.cpu().interrupts_enabled());

        assert!(sched.stop_thread(proc, a.id()));
        assert!(proc.cpu().interrupts_enabled());
    }

    #[test]
    fn test_blocking_preserves_critical_depth() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        proc.enter_critical();
        proc.enter_critical();
        sched.block_current(proc);

        // The idle thread now runs with its own (zero) depth.
        assert!(proc.current_thread().unwrap().is_idle());
        assert_eq!(proc.in_critical(), 0);
        assert_eq!(a.saved_critical(), 2);

        // When A is dispatched again its depth comes back verbatim.
        assert!(sched.unblock(proc, a.id(), WakeCause::Condition));
        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());
        assert_eq!(proc.in_critical(), 2);
        proc.leave_critical();
        proc.leave_critical();
    }

    #[test]
    fn test_remote_wakeup_goes_through_mailbox() {
        let sched = Scheduler::bring_up(2);
        let proc0 = sched.processor(CpuId(0));
        let proc1 = sched.processor(CpuId(1));
        let a = sched.add_thread(
            proc0,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(1),
        );
        tick(sched, proc1);
        assert_eq!(current_id(proc1), a.id());

        sched.block_current(proc1);
        assert!(proc1.current_thread().unwrap().is_idle());

        // CPU 0 wakes the thread: no remote counter is touched, only a
        // message is posted for CPU 1 to pick up.
        assert!(sched.unblock(proc0, a.id(), WakeCause::Condition));
        assert!(!proc1.mailbox().is_empty());
        assert_eq!(a.home_cpu(), CpuId(1));

        tick(sched, proc1);
        assert_eq!(current_id(proc1), a.id());
        assert!(proc1.mailbox().is_empty());
    }

    #[test]
    fn test_tick_counts_against_current_mode() {
        let sched = Scheduler::bring_up(1);
        let proc = sched.processor(CpuId(0));
        let a = sched.add_thread(
            proc,
            Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
            CpuId(0),
        );
        tick(sched, proc);
        assert_eq!(current_id(proc), a.id());

        let kernel_before = a.ticks_in_kernel();
        tick(sched, proc);
        assert_eq!(a.ticks_in_kernel(), kernel_before + 1);
        assert_eq!(a.ticks_in_user(), 0);
    }

    proptest! {
        // Every thread in a set of equal-priority peers runs within one
        // full rotation of the run queue.
        #[test]
        fn prop_no_starvation_at_equal_priority(count in 2usize..8) {
            let sched = Scheduler::bring_up(1);
            let proc = sched.processor(CpuId(0));
            let mut ids = vec![];
            for _ in 0..count {
                let t = sched.add_thread(
                    proc,
                    Thread::new(sched.allocate_thread_id(), "peer", ThreadPriority::Normal),
                    CpuId(0),
                );
                ids.push(t.id());
            }

            let slice = ThreadPriority::Normal.time_slice_ticks() as usize;
            let mut seen = vec![false; count];
            for _ in 0..(slice * (count + 1)) {
                tick(sched, proc);
                let current = current_id(proc);
                if let Some(pos) = ids.iter().position(|id| *id == current) {
                    seen[pos] = true;
                }
            }
            prop_assert!(seen.iter().all(|s| *s));
        }

        // Saved critical depth survives an arbitrary number of block /
        // unblock cycles unchanged.
        #[test]
        fn prop_critical_depth_round_trips(depth in 1u32..8, cycles in 1usize..4) {
            let sched = Scheduler::bring_up(1);
            let proc = sched.processor(CpuId(0));
            let a = sched.add_thread(
                proc,
                Thread::new(sched.allocate_thread_id(), "a", ThreadPriority::Normal),
                CpuId(0),
            );
            tick(sched, proc);

            for _ in 0..depth {
                proc.enter_critical();
            }
            for _ in 0..cycles {
                sched.block_current(proc);
                prop_assert_eq!(proc.in_critical(), 0);
                sched.unblock(proc, a.id(), WakeCause::Condition);
                tick(sched, proc);
                prop_assert_eq!(current_id(proc), a.id());
                prop_assert_eq!(proc.in_critical(), depth);
            }
            for _ in 0..depth {
                proc.leave_critical();
            }
        }
    }
}
