use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use kernel_cpumask::CpuId;
use kernel_sync::{IrqState, SpinLock};
use kernel_thread::{PrioClass, QueueResidence, ThreadRef, ThreadState, fair};
use kernel_time::TimeMs;

/// Ordering key of the timeshare trees: effective priority (with jitter
/// folded in at insert time) then an insertion sequence for stable ties.
pub type TsKey = (u64, u64);

/// The four class containers plus period accounting, all under the
/// scheduler lock.
pub struct RunQueues {
    pub urgent: VecDeque<ThreadRef>,
    pub rt: VecDeque<ThreadRef>,
    /// Timeshare threads still holding budget this period.
    pub ts_tree: BTreeMap<TsKey, ThreadRef>,
    /// Timeshare threads that exhausted their budget this period.
    pub completed: BTreeMap<TsKey, ThreadRef>,
    pub background: VecDeque<ThreadRef>,

    pub counts: [usize; PrioClass::COUNT],
    pub total_threads: usize,
    pub total_weight: u64,

    pub current_period: u64,
    pub period_start_ms: TimeMs,
    pub period_ms: TimeMs,
    pub period_enabled: bool,

    /// Thread currently on the CPU.
    pub current: Option<ThreadRef>,
    /// Dead threads awaiting the reaper, with the grace period opened at
    /// their death.
    pub reaper: Vec<(u64, ThreadRef)>,

    seq: u64,
}

impl RunQueues {
    fn new() -> Self {
        Self {
            urgent: VecDeque::new(),
            rt: VecDeque::new(),
            ts_tree: BTreeMap::new(),
            completed: BTreeMap::new(),
            background: VecDeque::new(),
            counts: [0; PrioClass::COUNT],
            total_threads: 0,
            total_weight: 0,
            current_period: 0,
            period_start_ms: 0,
            period_ms: 0,
            period_enabled: false,
            current: None,
            reaper: Vec::new(),
            seq: 0,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Both timeshare trees empty?
    #[must_use]
    pub fn ts_empty(&self) -> bool {
        self.ts_tree.is_empty() && self.completed.is_empty()
    }

    /// End of period: the completed tree becomes the current one.
    pub fn swap_ts_trees(&mut self) {
        debug_assert!(self.ts_tree.is_empty());
        core::mem::swap(&mut self.ts_tree, &mut self.completed);
        for t in self.ts_tree.values() {
            t.sched.with_lock(|s| s.residence = QueueResidence::RunqueueTree);
        }
    }
}

/// One per-CPU scheduler.
pub struct Scheduler {
    core_id: CpuId,
    pub irq: IrqState,
    pub queues: SpinLock<RunQueues>,
    /// One bit per non-empty class container.
    queue_bitmap: AtomicU8,
    tick_enabled: AtomicBool,
    /// Set while a thief holds this scheduler as its victim.
    pub being_robbed: AtomicBool,
    /// Set while this scheduler is out stealing.
    pub stealing_work: AtomicBool,
    /// When this CPU last went idle.
    pub idle_since_ms: AtomicU64,
}

impl Scheduler {
    #[must_use]
    pub fn new(core_id: CpuId) -> Self {
        Self {
            core_id,
            irq: IrqState::new(),
            queues: SpinLock::new(RunQueues::new()),
            queue_bitmap: AtomicU8::new(0),
            tick_enabled: AtomicBool::new(true),
            being_robbed: AtomicBool::new(false),
            stealing_work: AtomicBool::new(false),
            idle_since_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn core_id(&self) -> CpuId {
        self.core_id
    }

    pub fn set_bitmap_bit(&self, class: PrioClass) {
        self.queue_bitmap.fetch_or(1 << class as u8, Ordering::AcqRel);
    }

    pub fn clear_bitmap_bit(&self, class: PrioClass) {
        self.queue_bitmap
            .fetch_and(!(1 << class as u8), Ordering::AcqRel);
    }

    #[must_use]
    pub fn bitmap(&self) -> u8 {
        self.queue_bitmap.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tick_enabled(&self) -> bool {
        self.tick_enabled.load(Ordering::Acquire)
    }

    pub fn set_tick_enabled(&self, on: bool) -> bool {
        self.tick_enabled.swap(on, Ordering::AcqRel)
    }

    /// Runnable threads queued here (the running one excluded).
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.queues.with_lock(|q| q.total_threads)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queues.with_lock(|q| q.current.is_none() && q.total_threads == 0)
    }

    // ---- queue manipulation (lock held by caller via with_lock) ----------

    /// Links `t` into the right class container. The queues lock must be
    /// held; the thread must not be linked anywhere.
    pub fn add_thread_locked(&self, q: &mut RunQueues, t: &ThreadRef, now: TimeMs, jitter: i64) {
        assert!(t.state() != ThreadState::IdleThread, "idle thread never queues");

        let (class, key_prio, weight) = t.sched.with_lock(|s| {
            s.assert_unqueued();
            let jittered = s.effective_priority.saturating_add_signed(jitter);
            (s.perceived_class, jittered, s.weight)
        });

        match class {
            PrioClass::Timeshare => {
                let seq = q.next_seq();
                t.sched.with_lock(|s| {
                    s.completed_period = q.current_period.wrapping_sub(1);
                    s.residence = QueueResidence::RunqueueTree;
                });
                q.ts_tree.insert((key_prio, seq), t.clone());
                q.total_weight += weight;
            }
            PrioClass::Urgent => {
                t.sched.with_lock(|s| s.residence = QueueResidence::RunqueueList);
                q.urgent.push_back(t.clone());
            }
            PrioClass::Rt => {
                t.sched.with_lock(|s| s.residence = QueueResidence::RunqueueList);
                q.rt.push_back(t.clone());
            }
            PrioClass::Background => {
                t.sched.with_lock(|s| s.residence = QueueResidence::RunqueueList);
                q.background.push_back(t.clone());
            }
        }

        t.set_last_ran(self.core_id);
        q.counts[class as usize] += 1;
        q.total_threads += 1;
        self.set_bitmap_bit(class);

        if !q.period_enabled && q.total_threads >= 1 {
            q.period_enabled = true;
            self.period_start_locked(q, now);
        }
    }

    /// Unlinks `t` from whichever container holds it.
    pub fn remove_thread_locked(&self, q: &mut RunQueues, t: &ThreadRef) {
        let (class, residence) =
            t.sched.with_lock(|s| (s.perceived_class, s.residence));

        match residence {
            QueueResidence::RunqueueTree => {
                let key = Self::find_tree_key(&q.ts_tree, t).expect("thread not in ts tree");
                q.ts_tree.remove(&key);
            }
            QueueResidence::CompletedTree => {
                let key = Self::find_tree_key(&q.completed, t).expect("thread not in completed");
                q.completed.remove(&key);
            }
            QueueResidence::RunqueueList => {
                let list = match class {
                    PrioClass::Urgent => &mut q.urgent,
                    PrioClass::Rt => &mut q.rt,
                    PrioClass::Background => &mut q.background,
                    PrioClass::Timeshare => unreachable!("timeshare lives in the tree"),
                };
                let pos = list
                    .iter()
                    .position(|x| core::ptr::eq(x.as_ref(), t.as_ref()))
                    .expect("thread not on its class list");
                list.remove(pos);
            }
            other => panic!("remove of thread resident in {other:?}"),
        }

        t.sched.with_lock(|s| s.residence = QueueResidence::None);
        self.dec_count_locked(q, class);
        // Only tree residents contribute to the period weight sum.
        if residence == QueueResidence::RunqueueTree {
            q.total_weight = q
                .total_weight
                .saturating_sub(t.sched.with_lock(|s| s.weight));
        }
    }

    fn dec_count_locked(&self, q: &mut RunQueues, class: PrioClass) {
        q.counts[class as usize] -= 1;
        q.total_threads -= 1;
        if q.counts[class as usize] == 0 {
            self.clear_bitmap_bit(class);
        }
    }

    fn find_tree_key(tree: &BTreeMap<TsKey, ThreadRef>, t: &ThreadRef) -> Option<TsKey> {
        tree.iter()
            .find(|(_, v)| core::ptr::eq(v.as_ref(), t.as_ref()))
            .map(|(k, _)| *k)
    }

    /// Picks the highest-class runnable thread, opening a new period when
    /// the timeshare trees roll over. Returns `None` when every container
    /// is empty (the CPU should go idle).
    pub fn pick_next_locked(&self, q: &mut RunQueues, now: TimeMs) -> Option<ThreadRef> {
        let mut mask = self.bitmap();
        while mask != 0 {
            let level = 7 - mask.leading_zeros() as u8;
            mask &= !(1 << level);
            let class = PrioClass::from_raw(level);

            let picked = match class {
                PrioClass::Timeshare => {
                    if q.ts_tree.is_empty() && !q.completed.is_empty() {
                        q.swap_ts_trees();
                        self.period_start_locked(q, now);
                    }
                    q.ts_tree.pop_last().map(|(_, t)| t)
                }
                PrioClass::Urgent => q.urgent.pop_front(),
                PrioClass::Rt => q.rt.pop_front(),
                PrioClass::Background => q.background.pop_front(),
            };

            if let Some(t) = picked {
                t.sched.with_lock(|s| {
                    s.residence = QueueResidence::None;
                    s.context_switches += 1;
                    s.run_start_ms = now;
                });
                self.dec_count_locked(q, class);
                if class == PrioClass::Timeshare {
                    q.total_weight = q
                        .total_weight
                        .saturating_sub(t.sched.with_lock(|s| s.weight));
                }
                t.set_state(ThreadState::Running);
                t.set_running_on(Some(self.core_id));
                return Some(t);
            }
        }
        None
    }

    /// Opens a new period: bumps the counter, refreshes weights, hands out
    /// budgets and slices, and re-keys the tree.
    pub fn period_start_locked(&self, q: &mut RunQueues, now: TimeMs) {
        q.current_period += 1;

        // Refresh weights and effective priorities first.
        for t in q.ts_tree.values() {
            t.apply_cpu_penalty();
        }

        let mut total_weight = 0u64;
        for t in q.ts_tree.values() {
            total_weight += t.sched.with_lock(|s| s.weight);
        }
        let total_weight = total_weight.max(1);

        q.period_ms = fair::compute_period_ms(q.total_threads);
        q.period_start_ms = now;

        let current_period = q.current_period;
        let period_ms = q.period_ms;

        // Re-key with fresh priorities while handing out budgets.
        let old = core::mem::take(&mut q.ts_tree);
        for (_, t) in old {
            let key_prio = t.sched.with_lock(|s| {
                let budget = (period_ms * s.weight / total_weight).max(fair::MIN_SLICE_MS);
                s.period_runtime_ms = 0;
                s.budget_ms = budget;
                let slices = fair::derive_slice_count(s.activity_score, s.metrics);
                s.timeslice_ms = (budget / slices).max(1);
                let mult = u64::from(s.activity_score.max(1));
                s.virtual_period_runtime = 0;
                s.virtual_budget = budget * mult;
                s.completed_period = current_period.wrapping_sub(1);
                s.effective_priority
            });
            let seq = q.next_seq();
            q.ts_tree.insert((key_prio, seq), t);
        }
        q.total_weight = total_weight;
        q.period_enabled = true;
    }
}
