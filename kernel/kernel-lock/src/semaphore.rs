//! Counting semaphore built on the scheduler wake protocol.

use crate::turnstile::{LockKey, TurnstileTable};

use alloc::collections::VecDeque;
use kernel_cpumask::CpuId;
use kernel_sched::SchedulerSet;
use kernel_sync::SpinLock;
use kernel_thread::{BlockReason, ThreadRef, WaitType, WakeReason};

struct SemState {
    count: u64,
    waiters: VecDeque<ThreadRef>,
}

/// A counting semaphore; waiters queue FIFO.
pub struct Semaphore {
    state: SpinLock<SemState>,
    key: LockKey,
}

impl Semaphore {
    #[must_use]
    pub fn new(table: &TurnstileTable, initial: u64) -> Self {
        Self {
            state: SpinLock::new(SemState {
                count: initial,
                waiters: VecDeque::new(),
            }),
            key: table.new_lock_key(),
        }
    }

    /// Takes one unit, blocking the calling thread until available.
    pub fn wait(&self, set: &SchedulerSet, cpu: CpuId, current: &ThreadRef) {
        loop {
            let acquired = self.state.with_lock(|s| {
                if s.count > 0 {
                    s.count -= 1;
                    return true;
                }
                // Block before becoming visible to post(), under the same
                // lock, so a waker never pops a runnable thread.
                set.block(
                    current,
                    BlockReason::Manual,
                    WaitType::Interruptible,
                    self.key,
                );
                s.waiters.push_back(current.clone());
                false
            });
            if acquired {
                return;
            }

            set.yield_now(cpu);
            // Past the suspension point: wakers may requeue us now.
            current
                .yielded_after_wait
                .store(true, core::sync::atomic::Ordering::Release);
            current.wait_for_wake_match();
            set.resume_after_wake(cpu, current);
        }
    }

    /// Non-blocking take.
    pub fn try_wait(&self) -> bool {
        self.state.with_lock(|s| {
            if s.count > 0 {
                s.count -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Releases one unit, waking the longest waiter if any.
    pub fn post(&self, set: &SchedulerSet, waker_cpu: CpuId) {
        let woken = self.state.with_lock(|s| {
            s.count += 1;
            s.waiters.pop_front()
        });
        if let Some(t) = woken {
            let prio = t.perceived_class();
            set.wake(waker_cpu, &t, WakeReason::BlockingManual, prio, self.key);
        }
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.state.with_lock(|s| s.count)
    }
}
