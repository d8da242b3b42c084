//! Idle-push load balancing: a scheduler that has runnable work pushes a
//! share of it to an idle peer, scaled down across NUMA boundaries.

use crate::scheduler::{RunQueues, Scheduler};
use crate::set::SchedulerSet;

use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_cpumask::CpuId;
use kernel_thread::{PrioClass, ThreadFlags, ThreadRef};

/// Threads the source must hold before a long-idle peer forces a move.
const IDLE_MIN_MIGRATABLE: usize = 3;
/// How long the peer must have been idle for the forced move.
const IDLE_LONG_ENOUGH_MS: u64 = 10;

/// Cross-NUMA push scale: fraction = num / ((1 + dist) · den).
const REMOTE_SCALE_NUM: usize = 1;
const REMOTE_SCALE_DEN: usize = 5;

/// Whether `t` may be pulled onto `core` right now.
pub(crate) fn can_steal_thread(core: CpuId, t: &ThreadRef) -> bool {
    if t.flags().contains(ThreadFlags::NO_STEAL) {
        return false;
    }
    t.allowed_cpus.with_lock(|m| m.test(core))
}

fn migratable_per_class(
    target_core: CpuId,
    q: &RunQueues,
) -> [usize; PrioClass::COUNT] {
    let count_list = |list: &alloc::collections::VecDeque<ThreadRef>| {
        list.iter().filter(|t| can_steal_thread(target_core, t)).count()
    };
    let mut agg = [0; PrioClass::COUNT];
    agg[PrioClass::Urgent as usize] = count_list(&q.urgent);
    agg[PrioClass::Rt as usize] = count_list(&q.rt);
    agg[PrioClass::Background as usize] = count_list(&q.background);
    agg[PrioClass::Timeshare as usize] = q
        .ts_tree
        .values()
        .chain(q.completed.values())
        .filter(|t| can_steal_thread(target_core, t))
        .count();
    agg
}

impl SchedulerSet {
    /// Moves up to `target` threads of one class from `src` to `dst`, both
    /// queue locks held. Timeshare migration takes every other thread so
    /// neither end keeps only the extremes of the priority range.
    pub(crate) fn migrate_class_locked(
        &self,
        src: &Scheduler,
        src_q: &mut RunQueues,
        dst: &Scheduler,
        dst_q: &mut RunQueues,
        class: PrioClass,
        target: usize,
        now: u64,
    ) -> usize {
        if target == 0 {
            return 0;
        }
        let dest_core = dst.core_id();
        let mut moved = 0;

        let candidates: Vec<ThreadRef> = if class == PrioClass::Timeshare {
            let mut picked = Vec::new();
            let mut skip = false;
            for t in src_q.ts_tree.values().chain(src_q.completed.values()) {
                if picked.len() >= target {
                    break;
                }
                if skip {
                    skip = false;
                    continue;
                }
                if can_steal_thread(dest_core, t) {
                    picked.push(t.clone());
                    skip = true;
                }
            }
            picked
        } else {
            let list = match class {
                PrioClass::Urgent => &src_q.urgent,
                PrioClass::Rt => &src_q.rt,
                PrioClass::Background => &src_q.background,
                PrioClass::Timeshare => unreachable!(),
            };
            list.iter()
                .filter(|t| can_steal_thread(dest_core, t))
                .take(target)
                .cloned()
                .collect()
        };

        for t in candidates {
            t.being_moved.lock();
            if can_steal_thread(dest_core, &t) {
                src.remove_thread_locked(src_q, &t);
                dst.add_thread_locked(dst_q, &t, now, 0);
                t.set_last_ran(dest_core);
                moved += 1;
            }
            // Safety: locked just above.
            unsafe { t.being_moved.unlock() };
        }
        moved
    }

    /// Picks the least-loaded idle CPU, excluding `except`.
    fn push_target(&self, except: CpuId) -> Option<CpuId> {
        let idle = self.topology.idle_cpus();
        idle.iter()
            .filter(|c| *c != except)
            .min_by_key(|c| self.load_of(*c))
    }

    /// Pushes a share of this CPU's runnable threads to an idle peer.
    ///
    /// Same-node targets receive half of each class. Cross-node targets
    /// receive `count · num / ((1 + distance) · den)`, floored to one when
    /// the peer has been idle a while and we are clearly loaded.
    ///
    /// Returns the number of threads moved.
    pub fn try_push_to_idle(&self, cpu: CpuId) -> usize {
        let Some(other_cpu) = self.push_target(cpu) else {
            return 0;
        };

        let src = &self.schedulers[cpu];
        let dst = &self.schedulers[other_cpu];
        let now = self.clock.now_ms();

        // Trylock to avoid a deadlock window on the hot path.
        let (first, second) = if cpu < other_cpu { (src, dst) } else { (dst, src) };
        let Some(g1) = first.queues.try_lock() else { return 0 };
        let Some(g2) = second.queues.try_lock() else { return 0 };
        let (mut src_q, mut dst_q) = if cpu < other_cpu { (g1, g2) } else { (g2, g1) };

        let migratable = migratable_per_class(other_cpu, &src_q);
        if migratable.iter().sum::<usize>() == 0 {
            return 0;
        }

        let same_node = self.topology.same_numa(cpu, other_cpu);
        let mut moved = 0;

        for class_idx in 0..PrioClass::COUNT {
            let class = PrioClass::from_raw(class_idx as u8);
            let count = migratable[class_idx];
            if count == 0 {
                continue;
            }

            let to_move = if same_node {
                count / 2
            } else {
                let dist = usize::from(
                    self.topology
                        .distance(self.topology.numa_of(cpu), self.topology.numa_of(other_cpu)),
                )
                .max(1);
                let mut n = count * REMOTE_SCALE_NUM / ((1 + dist) * REMOTE_SCALE_DEN);
                let idle_for = now.saturating_sub(dst.idle_since_ms.load(Ordering::Relaxed));
                if n == 0
                    && count >= IDLE_MIN_MIGRATABLE
                    && idle_for >= IDLE_LONG_ENOUGH_MS
                {
                    n = 1;
                }
                n
            };

            moved += self.migrate_class_locked(src, &mut src_q, dst, &mut dst_q, class, to_move, now);
        }

        drop(src_q);
        drop(dst_q);

        if moved > 0 {
            self.topology.set_cpu_idle(other_cpu, false);
            self.send_resched(other_cpu);
            log::debug!("cpu {cpu}: pushed {moved} thread(s) to idle cpu {other_cpu}");
        }
        moved
    }
}
