//! Condition variable over the scheduler wake protocol.

use crate::mutex::Mutex;
use crate::turnstile::{LockKey, TurnstileTable};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_cpumask::CpuId;
use kernel_sched::SchedulerSet;
use kernel_sync::SpinLock;
use kernel_thread::{BlockReason, ThreadRef, WaitType, WakeReason};

type WaitKey = (i64, u64);

/// A condition variable. Waiters queue by perceived priority, so a signal
/// always releases the most important waiter first.
pub struct Condvar {
    waiters: SpinLock<BTreeMap<WaitKey, ThreadRef>>,
    seq: SpinLock<u64>,
    key: LockKey,
}

impl Condvar {
    #[must_use]
    pub fn new(table: &TurnstileTable) -> Self {
        Self {
            waiters: SpinLock::new(BTreeMap::new()),
            seq: SpinLock::new(0),
            key: table.new_lock_key(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> LockKey {
        self.key
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.with_lock(|w| w.len())
    }

    /// Declares `t` blocked and queues it, atomically with respect to
    /// signals: a signal pops under the same lock, so it can never observe
    /// a queued-but-still-runnable waiter.
    fn block_and_enqueue(&self, set: &SchedulerSet, t: &ThreadRef) {
        let prio = TurnstileTable::queue_priority(t);
        let seq = self.seq.with_lock(|s| {
            *s += 1;
            *s
        });
        self.waiters.with_lock(|w| {
            set.block(t, BlockReason::Manual, WaitType::Interruptible, self.key);
            w.insert((prio, seq), t.clone());
        });
    }

    fn remove_waiter(&self, t: &ThreadRef) -> bool {
        self.waiters.with_lock(|w| {
            let Some(k) = w.iter().find(|(_, v)| Arc::ptr_eq(v, t)).map(|(k, _)| *k) else {
                return false;
            };
            w.remove(&k);
            true
        })
    }

    /// Atomically releases `lock` and waits for a signal; reacquires the
    /// lock before returning the wake reason (SIGNAL or TIMEOUT).
    ///
    /// A timed variant is layered on top by arming a deferred event that
    /// calls [`timeout_wake`](Self::timeout_wake).
    pub fn wait(
        &self,
        set: &SchedulerSet,
        table: &TurnstileTable,
        cpu: CpuId,
        current: &ThreadRef,
        lock: &Mutex,
    ) -> WakeReason {
        self.block_and_enqueue(set, current);
        lock.unlock(set, table, cpu, current);
        set.yield_now(cpu);
        // Past the suspension point: wakers may requeue us now.
        current
            .yielded_after_wait
            .store(true, core::sync::atomic::Ordering::Release);

        current.wait_for_wake_match();
        set.resume_after_wake(cpu, current);

        // A racing timeout may leave us queued; a signal removed us.
        self.remove_waiter(current);

        let reason = current.sched.with_lock(|s| s.wake_reason);
        lock.lock(set, table, cpu, current);
        reason
    }

    /// Wakes the highest-priority waiter, passing it through `mark` before
    /// it can run. Returns the woken thread.
    pub fn signal_with_cb(
        &self,
        set: &SchedulerSet,
        waker_cpu: CpuId,
        mark: impl FnOnce(&ThreadRef),
    ) -> Option<ThreadRef> {
        let t = self.waiters.with_lock(|w| w.pop_last().map(|(_, t)| t))?;
        mark(&t);
        let prio = t.perceived_class();
        set.wake(waker_cpu, &t, WakeReason::Signal, prio, self.key);
        Some(t)
    }

    /// Wakes the highest-priority waiter.
    pub fn signal(&self, set: &SchedulerSet, waker_cpu: CpuId) -> Option<ThreadRef> {
        self.signal_with_cb(set, waker_cpu, |_| {})
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, set: &SchedulerSet, waker_cpu: CpuId) -> usize {
        let mut n = 0;
        while self.signal(set, waker_cpu).is_some() {
            n += 1;
        }
        n
    }

    /// Timeout delivery: wakes `t` with the TIMEOUT reason if it still
    /// waits here. Called from a deferred event.
    pub fn timeout_wake(&self, set: &SchedulerSet, waker_cpu: CpuId, t: &ThreadRef) -> bool {
        if !self.remove_waiter(t) {
            return false;
        }
        let prio = t.perceived_class();
        set.wake(waker_cpu, t, WakeReason::Timeout, prio, self.key)
    }
}
