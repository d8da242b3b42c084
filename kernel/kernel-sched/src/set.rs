use crate::rcu::RcuState;
use crate::rng::JitterRng;
use crate::scheduler::Scheduler;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_cpumask::CpuId;
use kernel_sync::{IrqLevel, SpinLock};
use kernel_thread::fair;
use kernel_thread::{
    BlockReason, PrioClass, QueueResidence, SleepReason, ThreadRef, ThreadState, WaitType,
    WakeReason,
};
use kernel_time::ClockRef;
use kernel_topology::Topology;

/// Hook the scheduler uses to nudge another CPU after a cross-CPU enqueue.
pub trait IpiSender: Send + Sync {
    fn send_resched(&self, cpu: CpuId);
}

/// Jitter spread applied to timeshare queue keys.
const KEY_JITTER: i64 = fair::REINSERT_THRESHOLD >> 2;

/// Decision of one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Keep running the current thread.
    Continue,
    /// The current thread was retired or preempted; pick again.
    Resched,
}

/// All per-CPU schedulers plus fleet-wide balancing state.
pub struct SchedulerSet {
    pub(crate) schedulers: Vec<Arc<Scheduler>>,
    pub(crate) topology: Arc<Topology>,
    pub(crate) clock: ClockRef,
    pub(crate) total_threads: AtomicU64,
    pub(crate) active_stealers: AtomicU32,
    pub(crate) max_concurrent_stealers: u32,
    ipi: SpinLock<Option<Arc<dyn IpiSender>>>,
    rng: SpinLock<JitterRng>,
    pub rcu: RcuState,
}

impl SchedulerSet {
    #[must_use]
    pub fn new(topology: Arc<Topology>, clock: ClockRef, rng_seed: u64) -> Self {
        let cpus = topology.cpu_count();
        let schedulers = (0..topology.cpu_count())
            .map(|cpu| Arc::new(Scheduler::new(cpu)))
            .collect();
        Self {
            schedulers,
            topology,
            clock,
            total_threads: AtomicU64::new(0),
            active_stealers: AtomicU32::new(0),
            max_concurrent_stealers: 4,
            ipi: SpinLock::new(None),
            rng: SpinLock::new(JitterRng::new(rng_seed)),
            rcu: RcuState::new(cpus),
        }
    }

    pub fn set_ipi_sender(&self, ipi: Arc<dyn IpiSender>) {
        *self.ipi.lock() = Some(ipi);
    }

    #[must_use]
    pub fn scheduler(&self, cpu: CpuId) -> &Arc<Scheduler> {
        &self.schedulers[cpu]
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.schedulers.len()
    }

    #[must_use]
    pub const fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    #[must_use]
    pub const fn clock(&self) -> &ClockRef {
        &self.clock
    }

    #[must_use]
    pub fn total_threads(&self) -> u64 {
        self.total_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn jitter(&self) -> i64 {
        self.rng.with_lock(|r| r.jitter(KEY_JITTER))
    }

    pub(crate) fn send_resched(&self, cpu: CpuId) {
        if let Some(ipi) = self.ipi.with_lock(|i| i.clone()) {
            ipi.send_resched(cpu);
        }
    }

    // ---- enqueue ---------------------------------------------------------

    /// Load of one CPU for placement decisions: queued threads plus one
    /// when something is running.
    pub(crate) fn load_of(&self, cpu: CpuId) -> usize {
        let sched = &self.schedulers[cpu];
        let queued = sched.thread_count();
        queued + usize::from(!self.topology.cpu_is_idle(cpu) || queued > 0)
    }

    /// Places a thread on the least-loaded allowed CPU.
    pub fn enqueue(&self, t: &ThreadRef) {
        let allowed = t.allowed_cpus.with_lock(|m| m.clone());
        assert!(!allowed.is_empty(), "thread with empty affinity mask");

        let mut best = None;
        let mut best_load = usize::MAX;
        for cpu in allowed.iter() {
            let load = self.load_of(cpu);
            if load < best_load {
                best_load = load;
                best = Some(cpu);
            }
        }

        self.enqueue_on(t, best.expect("affinity mask had no valid cpu"));
    }

    /// Places a thread on a specific CPU and nudges it.
    pub fn enqueue_on(&self, t: &ThreadRef, cpu: CpuId) {
        let sched = &self.schedulers[cpu];
        let now = self.clock.now_ms();
        let jitter = self.jitter();

        let _g = sched.irq.raise_guard(IrqLevel::Dispatch);
        sched
            .queues
            .with_lock(|q| sched.add_thread_locked(q, t, now, jitter));
        self.total_threads.fetch_add(1, Ordering::Relaxed);
        self.topology.set_cpu_idle(cpu, false);
        self.send_resched(cpu);
    }

    // ---- pick / yield ----------------------------------------------------

    /// Dispatches the next thread on `cpu`, idling the CPU when nothing is
    /// runnable.
    pub fn pick_next(&self, cpu: CpuId) -> Option<ThreadRef> {
        let sched = &self.schedulers[cpu];
        let now = self.clock.now_ms();

        let _g = sched.irq.raise_guard(IrqLevel::Dispatch);
        let picked = sched.queues.with_lock(|q| {
            let t = sched.pick_next_locked(q, now)?;
            q.current = Some(t.clone());
            Some(t)
        });

        match &picked {
            Some(t) => {
                self.total_threads.fetch_sub(1, Ordering::Relaxed);
                self.topology.set_cpu_idle(cpu, false);
                log::trace!("cpu {cpu}: dispatch thread {}", t.id);
            }
            None => {
                self.topology.set_cpu_idle(cpu, true);
                sched.idle_since_ms.store(now, Ordering::Relaxed);
            }
        }
        picked
    }

    /// Gives up the CPU: the current thread is re-queued (if still
    /// runnable), parked (if blocked or sleeping) or retired (if dying),
    /// and the next thread is dispatched.
    pub fn yield_now(&self, cpu: CpuId) -> Option<ThreadRef> {
        let sched = &self.schedulers[cpu];
        let now = self.clock.now_ms();
        let jitter = self.jitter();

        let _g = sched.irq.raise_guard(IrqLevel::Dispatch);
        let prev = sched.queues.with_lock(|q| q.current.take());

        if let Some(t) = prev {
            t.set_running_on(None);
            t.sched.with_lock(|s| {
                let start = s.run_start_ms;
                s.stats.record_runtime(start, now);
                let delta = now.saturating_sub(start);
                s.period_runtime_ms += delta;
            });

            match t.state() {
                ThreadState::Running | ThreadState::Ready => {
                    t.set_state(ThreadState::Ready);
                    sched
                        .queues
                        .with_lock(|q| sched.add_thread_locked(q, &t, now, jitter));
                    self.total_threads.fetch_add(1, Ordering::Relaxed);
                }
                ThreadState::Blocked | ThreadState::Sleeping => {
                    // Publish that the waker may now requeue us safely.
                    t.yielded_after_wait.store(true, Ordering::Release);
                }
                ThreadState::Zombie => {
                    let grace = self.rcu.start_grace();
                    sched.queues.with_lock(|q| {
                        t.sched.with_lock(|s| {
                            s.assert_unqueued();
                            s.residence = QueueResidence::Reaper;
                        });
                        q.reaper.push((grace, t.clone()));
                    });
                }
                other => panic!("yield with current thread in state {other:?}"),
            }
        }

        self.pick_next(cpu)
    }

    // ---- block / sleep / wake -------------------------------------------

    /// Declares the current thread blocked. The caller must follow with
    /// [`yield_now`](Self::yield_now) on the same CPU (or be the thread
    /// itself, which then waits for its wake match).
    pub fn block(
        &self,
        t: &ThreadRef,
        reason: BlockReason,
        wait: WaitType,
        expect_wake_src: u64,
    ) {
        t.note_block(reason, wait, expect_wake_src, self.clock.now_ms());
    }

    /// Declares the current thread sleeping.
    pub fn sleep(
        &self,
        t: &ThreadRef,
        reason: SleepReason,
        wait: WaitType,
        expect_wake_src: u64,
    ) {
        t.note_sleep(reason, wait, expect_wake_src, self.clock.now_ms());
    }

    /// Wakes `t` with `reason`, placing it at `prio`. Returns whether the
    /// thread actually woke.
    ///
    /// An UNINTERRUPTIBLE waiter only wakes when `wake_src` matches the
    /// source it armed. The waker spins until the target has truly yielded
    /// when the target last ran on another CPU, so a thread that declared
    /// itself blocked but still runs is never requeued.
    pub fn wake(
        &self,
        waker_cpu: CpuId,
        t: &ThreadRef,
        reason: WakeReason,
        prio: PrioClass,
        wake_src: u64,
    ) -> bool {
        let (owner, old_flags) = t.pin_and_read_last_ran();
        let sched = &self.schedulers[owner];

        if owner != waker_cpu {
            while !t.yielded_after_wait.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }

        let _g = sched.irq.raise_guard(IrqLevel::Dispatch);

        let woke = {
            let state = t.state();
            let wt = t.wait_type();
            let expected = t.sched.with_lock(|s| s.expected_wake_src);

            if wt == WaitType::None
                || (wt == WaitType::Uninterruptible && expected != wake_src)
                || !matches!(state, ThreadState::Blocked | ThreadState::Sleeping)
            {
                false
            } else {
                let now = self.clock.now_ms();
                t.note_wake(reason, now);
                t.apply_wake_boost(self.jitter());
                t.classify_activity(now);
                t.sched.with_lock(|s| s.perceived_class = prio);
                t.publish_wake(wake_src);
                t.set_wait_type(WaitType::None);

                let yielded = t.yielded_after_wait.load(Ordering::Acquire);
                if yielded {
                    let jitter = self.jitter();
                    sched
                        .queues
                        .with_lock(|q| sched.add_thread_locked(q, t, now, jitter));
                    self.total_threads.fetch_add(1, Ordering::Relaxed);
                    self.topology.set_cpu_idle(owner, false);
                    self.send_resched(owner);
                }
                true
            }
        };

        t.unpin(old_flags);
        woke
    }

    /// A thread resuming from its wake match reclaims the CPU slot it is
    /// being run on: it leaves whatever runqueue the waker put it on and
    /// becomes the current thread of `cpu` if that slot is free.
    pub fn resume_after_wake(&self, cpu: CpuId, t: &ThreadRef) {
        let (owner, old_flags) = t.pin_and_read_last_ran();
        let sched = &self.schedulers[owner];

        sched.queues.with_lock(|q| {
            let linked = t.sched.with_lock(|s| s.residence != QueueResidence::None);
            if linked {
                sched.remove_thread_locked(q, t);
                self.total_threads.fetch_sub(1, Ordering::Relaxed);
            }
        });
        t.unpin(old_flags);

        t.set_state(ThreadState::Running);
        t.set_running_on(Some(cpu));
        t.clear_wake_data();

        let target = &self.schedulers[cpu];
        target.queues.with_lock(|q| {
            if q.current.is_none() {
                q.current = Some(t.clone());
            }
        });
    }

    // ---- tick ------------------------------------------------------------

    /// Periodic accounting for the running thread of `cpu`.
    pub fn tick(&self, cpu: CpuId) -> TickAction {
        let sched = &self.schedulers[cpu];
        if !sched.tick_enabled() {
            return TickAction::Continue;
        }

        let now = self.clock.now_ms();
        self.rcu.quiescent(cpu);
        let _g = sched.irq.raise_guard(IrqLevel::Dispatch);

        let Some(t) = sched.queues.with_lock(|q| q.current.clone()) else {
            return TickAction::Continue;
        };

        t.classify_activity(now);
        t.apply_cpu_penalty();

        let (class, retire, preempt) = t.sched.with_lock(|s| {
            let start = s.run_start_ms;
            let delta = now.saturating_sub(start);
            s.stats.record_runtime(start, now);
            s.run_start_ms = now;
            s.period_runtime_ms += delta;
            s.virtual_period_runtime += delta * u64::from(s.activity_score.max(1));
            s.metrics = s.stats.metrics();

            let retire = s.perceived_class == PrioClass::Timeshare
                && s.virtual_period_runtime >= s.virtual_budget
                && s.virtual_budget > 0;
            let preempt = s.perceived_class.has_timeslice()
                && s.period_runtime_ms >= s.timeslice_ms
                && !retire;
            (s.perceived_class, retire, preempt)
        });

        if retire {
            // Budget exhausted: retire into the completed tree.
            self.retire_current(cpu, &t);
            return TickAction::Resched;
        }

        if preempt {
            t.sched.with_lock(|s| s.preemptions += 1);
            return TickAction::Resched;
        }

        // A higher class with runnable work always preempts.
        let bitmap = sched.bitmap();
        let higher = bitmap & !((1u8 << (class as u8 + 1)) - 1);
        if higher != 0 {
            return TickAction::Resched;
        }

        TickAction::Continue
    }

    fn retire_current(&self, cpu: CpuId, t: &ThreadRef) {
        let sched = &self.schedulers[cpu];
        sched.queues.with_lock(|q| {
            if q.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, t)) {
                q.current = None;
            }
            t.set_running_on(None);
            t.set_state(ThreadState::Ready);
            let key_prio = t.sched.with_lock(|s| {
                s.assert_unqueued();
                s.residence = QueueResidence::CompletedTree;
                s.completed_period = q.current_period;
                s.effective_priority
            });
            let seq = q.next_seq();
            q.completed.insert((key_prio, seq), t.clone());
            q.counts[PrioClass::Timeshare as usize] += 1;
            q.total_threads += 1;
            sched.set_bitmap_bit(PrioClass::Timeshare);
        });
        self.total_threads.fetch_add(1, Ordering::Relaxed);
    }

    // ---- migration -------------------------------------------------------

    /// Moves `t` to `dest_cpu`, taking both scheduler locks in id order.
    pub fn migrate(&self, t: &ThreadRef, dest_cpu: CpuId) {
        let (src_cpu, old_flags) = t.pin_and_read_last_ran();
        if src_cpu == dest_cpu {
            t.unpin(old_flags);
            return;
        }

        let src = &self.schedulers[src_cpu];
        let dst = &self.schedulers[dest_cpu];
        let now = self.clock.now_ms();
        let jitter = self.jitter();

        // Lock order: always the lower core id first.
        let (first, second) = if src_cpu < dest_cpu { (src, dst) } else { (dst, src) };
        let g1 = first.queues.lock();
        let g2 = second.queues.lock();
        let (mut src_q, mut dst_q) = if src_cpu < dest_cpu { (g1, g2) } else { (g2, g1) };

        let linked = t.sched.with_lock(|s| s.residence != QueueResidence::None);
        if linked {
            src.remove_thread_locked(&mut src_q, t);
            dst.add_thread_locked(&mut dst_q, t, now, jitter);
            t.set_last_ran(dest_cpu);
        } else {
            // Not queued (running or waiting); it will land on the new CPU
            // at its next enqueue.
            t.set_last_ran(dest_cpu);
        }
        drop(src_q);
        drop(dst_q);

        t.migrate_to.store(-1, Ordering::Release);
        t.unpin(old_flags);
        self.send_resched(dest_cpu);
    }

    // ---- reaper ----------------------------------------------------------

    /// Retires the current thread of `cpu`: it becomes a zombie on the
    /// per-CPU reaper list and the next thread is dispatched.
    pub fn exit_current(&self, cpu: CpuId) -> Option<ThreadRef> {
        let sched = &self.schedulers[cpu];
        let t = sched.queues.with_lock(|q| q.current.clone());
        if let Some(t) = &t {
            t.dying.store(true, Ordering::Release);
            t.set_state(ThreadState::Zombie);
        }
        self.yield_now(cpu)
    }

    /// Frees zombies whose grace period has elapsed and whose only
    /// remaining reference is the reaper list. Returns the released ids.
    pub fn reap(&self, cpu: CpuId) -> Vec<u64> {
        let sched = &self.schedulers[cpu];
        let mut freed = Vec::new();

        let candidates = sched.queues.with_lock(|q| core::mem::take(&mut q.reaper));
        let mut keep = Vec::new();
        for (grace, t) in candidates {
            if self.rcu.grace_elapsed(grace) && Arc::strong_count(&t) == 1 {
                t.set_state(ThreadState::Terminated);
                freed.push(t.id);
            } else {
                keep.push((grace, t));
            }
        }
        sched.queues.with_lock(|q| q.reaper.extend(keep));
        freed
    }
}
