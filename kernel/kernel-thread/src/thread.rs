use crate::activity::{ActivityData, ActivityMetrics, ActivityStats};
use crate::fair;
use crate::state::{
    ActivityClass, BlockReason, PrioClass, QueueResidence, SleepReason, ThreadFlags, ThreadState,
    WaitType, WakeReason,
};

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};
use kernel_cpumask::{CpuId, CpuMask};
use kernel_sync::{RawSpin, SpinLock};
use kernel_time::TimeMs;

/// Shared handle to a thread.
pub type ThreadRef = Arc<Thread>;

/// Sentinel for "no turnstile attached".
pub const NO_TURNSTILE: usize = usize::MAX;

/// Entry point of a kernel thread.
pub type ThreadEntry = fn(arg: usize);

/// Mutable scheduling state, guarded by the thread spinlock.
///
/// Lock ordering: the scheduler lock governing the thread is always taken
/// *before* this lock.
pub struct ThreadSched {
    pub base_class: PrioClass,
    pub perceived_class: PrioClass,
    pub activity_class: ActivityClass,
    pub activity_score: u32,
    pub dynamic_delta: i64,
    pub weight: u64,
    pub niceness: i8,
    /// Pre-boost values restored when priority inheritance ends.
    pub saved_class: Option<PrioClass>,
    pub saved_weight: u64,
    pub effective_priority: u64,

    pub completed_period: u64,
    pub period_runtime_ms: TimeMs,
    pub budget_ms: TimeMs,
    pub timeslice_ms: TimeMs,
    pub virtual_period_runtime: u64,
    pub virtual_budget: u64,
    pub run_start_ms: TimeMs,
    pub last_class_change_ms: TimeMs,

    pub activity: ActivityData,
    pub stats: ActivityStats,
    pub metrics: ActivityMetrics,

    pub residence: QueueResidence,
    pub wake_reason: WakeReason,
    pub expected_wake_src: u64,

    pub boost_count: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub total_wake_count: u64,
    pub total_block_count: u64,
    pub total_sleep_count: u64,
}

/// A kernel execution context.
///
/// Threads are shared as [`ThreadRef`]s; hot state lives in atomics, the
/// rest behind the per-thread spinlock.
pub struct Thread {
    pub id: u64,
    pub name: String,
    pub entry: Option<ThreadEntry>,
    pub entry_arg: usize,

    /// Stack range carved from the stack arena; `(base, size)`.
    pub stack: (u64, u64),

    state: AtomicU8,
    pub dying: AtomicBool,

    /// CPU currently running this thread, -1 when not running.
    curr_core: AtomicI64,
    /// Scheduler currently responsible for the thread's placement.
    last_ran: AtomicU64,
    /// Requested migration target, -1 when none.
    pub migrate_to: AtomicI64,

    flags: AtomicU32,
    /// Pin taken while the thread is being detached or moved.
    pub being_moved: RawSpin,

    pub allowed_cpus: SpinLock<CpuMask>,

    // Block/sleep vs. wake synchronization.
    pub yielded_after_wait: AtomicBool,
    wait_type: AtomicU8,
    wake_src: AtomicU64,
    pub wake_matched: AtomicBool,

    /// Turnstile this thread owns (lends while blocking).
    pub owned_turnstile: AtomicU64,
    /// Lock object this thread is blocked on, 0 when none.
    pub blocked_on: AtomicU64,

    pub creation_time_ms: TimeMs,
    pub sched: SpinLock<ThreadSched>,
}

impl Thread {
    #[must_use]
    pub fn new(
        id: u64,
        name: String,
        entry: Option<ThreadEntry>,
        entry_arg: usize,
        stack: (u64, u64),
        cpus: usize,
        creator_cpu: CpuId,
        now: TimeMs,
    ) -> ThreadRef {
        Arc::new(Self {
            id,
            name,
            entry,
            entry_arg,
            stack,
            state: AtomicU8::new(ThreadState::Ready as u8),
            dying: AtomicBool::new(false),
            curr_core: AtomicI64::new(-1),
            last_ran: AtomicU64::new(creator_cpu as u64),
            migrate_to: AtomicI64::new(-1),
            flags: AtomicU32::new(0),
            being_moved: RawSpin::new(),
            allowed_cpus: SpinLock::new(CpuMask::all(cpus)),
            yielded_after_wait: AtomicBool::new(true),
            wait_type: AtomicU8::new(WaitType::None as u8),
            wake_src: AtomicU64::new(0),
            wake_matched: AtomicBool::new(false),
            owned_turnstile: AtomicU64::new(NO_TURNSTILE as u64),
            blocked_on: AtomicU64::new(0),
            creation_time_ms: now,
            sched: SpinLock::new(ThreadSched::new(now)),
        })
    }

    // ---- atomics ---------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn or_flags(&self, f: ThreadFlags) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.fetch_or(f.bits(), Ordering::AcqRel))
    }

    pub fn set_flags(&self, f: ThreadFlags) {
        self.flags.store(f.bits(), Ordering::Release);
    }

    #[must_use]
    pub fn wait_type(&self) -> WaitType {
        WaitType::from_raw(self.wait_type.load(Ordering::Acquire))
    }

    pub fn set_wait_type(&self, w: WaitType) {
        self.wait_type.store(w as u8, Ordering::Release);
    }

    #[must_use]
    pub fn last_ran(&self) -> CpuId {
        self.last_ran.load(Ordering::Acquire) as CpuId
    }

    pub fn set_last_ran(&self, cpu: CpuId) {
        self.last_ran.store(cpu as u64, Ordering::Release);
    }

    /// Pins the thread against migration, sets NO_STEAL, and reads the
    /// owning scheduler id without racing a concurrent move. The caller
    /// must release `being_moved` and restore the flags.
    #[must_use]
    pub fn pin_and_read_last_ran(&self) -> (CpuId, ThreadFlags) {
        let old = self.or_flags(ThreadFlags::NO_STEAL);
        self.being_moved.lock();
        (self.last_ran(), old)
    }

    pub fn unpin(&self, old_flags: ThreadFlags) {
        // Safety: paired with the lock in pin_and_read_last_ran.
        unsafe { self.being_moved.unlock() };
        self.set_flags(old_flags);
    }

    #[must_use]
    pub fn running_on(&self) -> Option<CpuId> {
        let v = self.curr_core.load(Ordering::Acquire);
        usize::try_from(v).ok()
    }

    pub fn set_running_on(&self, cpu: Option<CpuId>) {
        let v = cpu.map_or(-1, |c| c as i64);
        self.curr_core.store(v, Ordering::Release);
    }

    // ---- wake matching ---------------------------------------------------

    /// Publishes the wake source, then the match flag with release order,
    /// so the waiter observing `wake_matched` also sees the source.
    pub fn publish_wake(&self, wake_src: u64) {
        self.wake_src.store(wake_src, Ordering::Release);
        self.wake_matched.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn wake_src(&self) -> u64 {
        self.wake_src.load(Ordering::Acquire)
    }

    /// Clears the block/wake exchange state after a completed wait.
    pub fn clear_wake_data(&self) {
        self.wake_src.store(0, Ordering::Release);
        self.wake_matched.store(false, Ordering::Release);
        self.set_wait_type(WaitType::None);
        self.sched.with_lock(|s| s.expected_wake_src = 0);
    }

    /// Cooperative suspension point: spins until a waker matches.
    pub fn wait_for_wake_match(&self) {
        while !self.wake_matched.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    // ---- event recording -------------------------------------------------

    /// Marks the thread blocked and records the event.
    pub fn note_block(&self, reason: BlockReason, wait: WaitType, expect_src: u64, now: TimeMs) {
        self.set_state(ThreadState::Blocked);
        self.set_wait_type(wait);
        self.wake_matched.store(false, Ordering::Release);
        self.yielded_after_wait.store(false, Ordering::Release);
        self.sched.with_lock(|s| {
            s.expected_wake_src = expect_src;
            s.total_block_count += 1;
            let start = s.run_start_ms;
            s.stats.record_runtime(start, now);
            let (activity, stats) = (&mut s.activity, &mut s.stats);
            activity.add_block(stats, reason as u8, now);
        });
    }

    /// Marks the thread sleeping and records the event.
    pub fn note_sleep(&self, reason: SleepReason, wait: WaitType, expect_src: u64, now: TimeMs) {
        self.set_state(ThreadState::Sleeping);
        self.set_wait_type(wait);
        self.wake_matched.store(false, Ordering::Release);
        self.yielded_after_wait.store(false, Ordering::Release);
        self.sched.with_lock(|s| {
            s.expected_wake_src = expect_src;
            s.total_sleep_count += 1;
            let start = s.run_start_ms;
            s.stats.record_runtime(start, now);
            let (activity, stats) = (&mut s.activity, &mut s.stats);
            activity.add_sleep(stats, reason as u8, now);
        });
    }

    /// Records a wake and readies the thread. Caller holds the scheduler
    /// and thread locks of the wake path.
    pub fn note_wake(&self, reason: WakeReason, now: TimeMs) {
        self.set_state(ThreadState::Ready);
        self.sched.with_lock(|s| {
            s.total_wake_count += 1;
            s.wake_reason = reason;
            let (activity, stats) = (&mut s.activity, &mut s.stats);
            activity.add_wake(stats, reason, now);
            s.metrics = s.stats.metrics();
        });
    }

    // ---- priority --------------------------------------------------------

    #[must_use]
    pub fn perceived_class(&self) -> PrioClass {
        self.sched.with_lock(|s| s.perceived_class)
    }

    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.perceived_class().is_realtime()
    }

    /// Recomputes metrics, applies the wake boost and refreshes the
    /// effective priority. `jitter` is supplied by the scheduler's PRNG.
    pub fn apply_wake_boost(&self, jitter: i64) {
        self.sched.with_lock(|s| {
            if s.perceived_class.is_realtime() {
                return;
            }
            s.metrics = s.stats.metrics();
            let change = fair::wake_boost_delta(s.metrics, s.activity_class) + jitter;
            s.dynamic_delta = (s.dynamic_delta + change).clamp(-fair::DELTA_MAX, fair::DELTA_MAX);
            s.update_effective_priority();
        });
    }

    /// Applies the CPU-bound penalty and decays the delta; one call per
    /// accounting pass.
    pub fn apply_cpu_penalty(&self) {
        self.sched.with_lock(|s| {
            s.metrics = s.stats.metrics();
            if s.activity_class == ActivityClass::CpuBound {
                let penalty = fair::cpu_penalty(s.metrics);
                s.dynamic_delta =
                    (s.dynamic_delta - penalty).clamp(-fair::DELTA_MAX, fair::DELTA_MAX);
            }
            s.dynamic_delta = fair::decay_delta(s.dynamic_delta);
            s.update_effective_priority();
        });
    }

    /// Reclassifies the activity class, rate-limited to one change per
    /// hysteresis window.
    pub fn classify_activity(&self, now: TimeMs) {
        self.sched.with_lock(|s| {
            if now.saturating_sub(s.last_class_change_ms) < fair::HYSTERESIS_MS {
                return;
            }
            s.metrics = s.stats.metrics();
            s.activity_class = fair::classify_activity(s.metrics);
            s.last_class_change_ms = now;
        });
    }

    // ---- class management ------------------------------------------------

    pub fn set_timeshare(&self) {
        self.sched.with_lock(|s| {
            s.base_class = PrioClass::Timeshare;
            s.perceived_class = PrioClass::Timeshare;
        });
    }

    pub fn set_background(&self) {
        self.sched.with_lock(|s| {
            s.base_class = PrioClass::Background;
            s.perceived_class = PrioClass::Background;
        });
    }

    pub fn set_urgent(&self) {
        self.sched.with_lock(|s| {
            s.base_class = PrioClass::Urgent;
            s.perceived_class = PrioClass::Urgent;
        });
    }

    pub fn set_rt(&self) {
        self.sched.with_lock(|s| {
            s.base_class = PrioClass::Rt;
            s.perceived_class = PrioClass::Rt;
        });
    }

    /// Temporarily raises the perceived class, returning the previous one.
    pub fn boost_self(&self, new: PrioClass) -> PrioClass {
        self.sched.with_lock(|s| {
            let old = s.perceived_class;
            s.perceived_class = new;
            old
        })
    }

    /// Restores the perceived class to the base class.
    pub fn unboost_self(&self) -> PrioClass {
        self.sched.with_lock(|s| {
            let old = s.perceived_class;
            s.perceived_class = s.base_class;
            old
        })
    }
}

impl ThreadSched {
    fn new(now: TimeMs) -> Self {
        Self {
            base_class: PrioClass::Timeshare,
            perceived_class: PrioClass::Timeshare,
            activity_class: ActivityClass::Unknown,
            activity_score: fair::ACT_CPU_BOUND_AVG,
            dynamic_delta: 0,
            weight: fair::BASE_WEIGHT as u64,
            niceness: 0,
            saved_class: None,
            saved_weight: 0,
            effective_priority: u64::from(fair::ACT_CPU_BOUND_AVG),
            completed_period: 0,
            period_runtime_ms: 0,
            budget_ms: 0,
            timeslice_ms: crate::DEFAULT_TIMESLICE_MS,
            virtual_period_runtime: 0,
            virtual_budget: 0,
            run_start_ms: now,
            last_class_change_ms: 0,
            activity: ActivityData::default(),
            stats: ActivityStats::default(),
            metrics: ActivityMetrics::default(),
            residence: QueueResidence::None,
            wake_reason: WakeReason::None,
            expected_wake_src: 0,
            boost_count: 0,
            context_switches: 0,
            preemptions: 0,
            total_wake_count: 0,
            total_block_count: 0,
            total_sleep_count: 0,
        }
    }

    /// Refreshes score, weight and the queue key from the current window.
    pub fn update_effective_priority(&mut self) {
        self.activity_score = fair::effective_score(self.activity_class, self.dynamic_delta);
        self.weight = fair::base_weight(self.metrics, self.dynamic_delta, self.niceness);
        self.effective_priority = u64::from(self.activity_score);
    }

    /// Virtual runtime still available this period.
    #[must_use]
    pub const fn virtual_runtime_left(&self) -> u64 {
        self.virtual_budget.saturating_sub(self.virtual_period_runtime)
    }

    /// Asserts that the thread is in no container before an insert.
    pub fn assert_unqueued(&self) {
        assert_eq!(
            self.residence,
            QueueResidence::None,
            "thread already linked into {:?}",
            self.residence
        );
    }
}
