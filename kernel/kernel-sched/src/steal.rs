//! Pull balancing: an underloaded scheduler steals from the busiest peer.

use crate::balance::can_steal_thread;
use crate::scheduler::Scheduler;
use crate::set::SchedulerSet;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_cpumask::CpuId;
use kernel_thread::{PrioClass, ThreadRef};

impl SchedulerSet {
    /// A scheduler may steal only while it sits below the fleet average.
    #[must_use]
    pub fn can_steal_work(&self, cpu: CpuId) -> bool {
        let avg = self.total_threads() / self.cpu_count() as u64;
        (self.schedulers[cpu].thread_count() as u64) < avg
    }

    /// Victim threshold in percent: lighter fleets demand a bigger load
    /// difference before stealing pays off.
    #[must_use]
    pub fn steal_threshold(&self) -> u64 {
        let per_core = self.total_threads() / self.cpu_count() as u64;
        if per_core <= 1 {
            return 150;
        }
        if per_core >= 64 {
            return 110;
        }
        150 - per_core.ilog2() as u64 * 5
    }

    fn try_begin_steal(&self) -> bool {
        let mut current = self.active_stealers.load(Ordering::Acquire);
        while current < self.max_concurrent_stealers {
            match self.active_stealers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
        false
    }

    fn end_steal(&self, thief: &Scheduler, victim: Option<&Arc<Scheduler>>) {
        if let Some(v) = victim {
            v.being_robbed.store(false, Ordering::Release);
        }
        thief.stealing_work.store(false, Ordering::Release);
        self.active_stealers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Picks the most loaded peer whose load clears the threshold; marks it
    /// robbed for the duration of the theft.
    fn pick_victim(&self, cpu: CpuId) -> Option<Arc<Scheduler>> {
        let threshold = self.steal_threshold();
        let my_count = self.schedulers[cpu].thread_count() as u64;

        let mut best: Option<&Arc<Scheduler>> = None;
        let mut best_count = 0u64;
        for (i, candidate) in self.schedulers.iter().enumerate() {
            if i == cpu {
                continue;
            }
            let busy = candidate.being_robbed.load(Ordering::Acquire)
                || candidate.stealing_work.load(Ordering::Acquire);

            let mut count = candidate.thread_count() as u64;
            if !self.topology.cpu_is_idle(i) {
                count += 1;
            }

            let poor = count * 100 < my_count * threshold;
            if busy || poor {
                continue;
            }
            if count > best_count {
                best_count = count;
                best = Some(candidate);
            }
        }

        let victim = best?;
        victim.being_robbed.store(true, Ordering::Release);
        Some(Arc::clone(victim))
    }

    /// Detaches one stealable thread from `victim`, walking the priority
    /// bitmap high to low; timeshare candidates alternate, current tree
    /// before completed.
    fn steal_one(&self, cpu: CpuId, victim: &Scheduler) -> Option<ThreadRef> {
        let mut q = victim.queues.try_lock()?;

        let mut mask = victim.bitmap();
        while mask != 0 {
            let level = 7 - mask.leading_zeros() as u8;
            mask &= !(1 << level);
            let class = PrioClass::from_raw(level);

            let candidates: Vec<ThreadRef> = if class == PrioClass::Timeshare {
                // Every-other over descending priority, current then
                // completed tree.
                let mut picked = Vec::new();
                let mut skip = false;
                for t in q.ts_tree.values().rev().chain(q.completed.values().rev()) {
                    if skip {
                        skip = false;
                        continue;
                    }
                    picked.push(t.clone());
                    skip = true;
                }
                picked
            } else {
                let list = match class {
                    PrioClass::Urgent => &q.urgent,
                    PrioClass::Rt => &q.rt,
                    PrioClass::Background => &q.background,
                    PrioClass::Timeshare => unreachable!(),
                };
                list.iter().cloned().collect()
            };

            for t in candidates {
                t.being_moved.lock();
                if can_steal_thread(cpu, &t) {
                    victim.remove_thread_locked(&mut q, &t);
                    // Safety: locked just above.
                    unsafe { t.being_moved.unlock() };
                    return Some(t);
                }
                // Safety: locked just above.
                unsafe { t.being_moved.unlock() };
            }
        }
        None
    }

    /// Attempts a full steal cycle for `cpu`: eligibility gate, stealer
    /// slot, victim selection, theft. On a miss the scheduler tries an
    /// idle push instead. The stolen thread is queued locally.
    pub fn try_steal(&self, cpu: CpuId) -> Option<ThreadRef> {
        if !self.can_steal_work(cpu) {
            return None;
        }
        if !self.try_begin_steal() {
            return None;
        }

        let thief = &self.schedulers[cpu];
        thief.stealing_work.store(true, Ordering::Release);

        let victim = self.pick_victim(cpu);
        let stolen = victim.as_ref().and_then(|v| self.steal_one(cpu, v));
        self.end_steal(thief, victim.as_ref());

        match stolen {
            Some(t) => {
                let now = self.clock.now_ms();
                thief
                    .queues
                    .with_lock(|q| thief.add_thread_locked(q, &t, now, 0));
                self.topology.set_cpu_idle(cpu, false);
                log::debug!("cpu {cpu}: stole thread {} from cpu {}", t.id, t.last_ran());
                t.set_last_ran(cpu);
                Some(t)
            }
            None => {
                self.try_push_to_idle(cpu);
                None
            }
        }
    }
}
