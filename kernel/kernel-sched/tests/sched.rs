use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kernel_sched::{IpiSender, SchedulerSet, TickAction};
use kernel_thread::{PrioClass, Thread, ThreadRef, ThreadState};
use kernel_time::ManualClock;
use kernel_topology::{Topology, TopologySpec};

struct Fixture {
    set: SchedulerSet,
    clock: Arc<ManualClock>,
}

fn fixture(cpus: usize) -> Fixture {
    let topo = Arc::new(Topology::build(&TopologySpec::uniform(cpus)));
    let clock = Arc::new(ManualClock::new());
    let set = SchedulerSet::new(topo, clock.clone(), 42);
    Fixture { set, clock }
}

fn mk_thread(id: u64, cpus: usize) -> ThreadRef {
    Thread::new(id, format!("t{id}"), None, 0, (0, 0), cpus, 0, 0)
}

struct CountingIpi(AtomicUsize);
impl IpiSender for CountingIpi {
    fn send_resched(&self, _cpu: usize) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn picks_higher_class_first() {
    let f = fixture(1);
    let bg = mk_thread(1, 1);
    bg.set_background();
    let ts = mk_thread(2, 1);
    let rt = mk_thread(3, 1);
    rt.set_rt();
    let urgent = mk_thread(4, 1);
    urgent.set_urgent();

    for t in [&bg, &ts, &rt, &urgent] {
        f.set.enqueue_on(t, 0);
    }

    let order: Vec<u64> = std::iter::from_fn(|| {
        let t = f.set.pick_next(0)?;
        Some(t.id)
    })
    .take(4)
    .collect();
    assert_eq!(order, [4, 3, 2, 1], "urgent > rt > timeshare > background");
}

#[test]
fn timeshare_orders_by_effective_priority() {
    let f = fixture(1);
    let low = mk_thread(1, 1);
    let high = mk_thread(2, 1);

    // Push the two into different activity bands, far beyond the bounded
    // jitter, so the period re-key keeps them apart.
    low.sched.with_lock(|s| {
        s.activity_class = kernel_thread::ActivityClass::CpuBound;
        s.dynamic_delta = -200;
        s.update_effective_priority();
    });
    high.sched.with_lock(|s| {
        s.activity_class = kernel_thread::ActivityClass::Interactive;
        s.dynamic_delta = 200;
        s.update_effective_priority();
    });

    f.set.enqueue_on(&low, 0);
    f.set.enqueue_on(&high, 0);

    let first = f.set.pick_next(0).unwrap();
    assert_eq!(first.id, 2, "greater key runs first");
}

#[test]
fn enqueue_prefers_least_loaded_cpu() {
    let f = fixture(2);
    // Load CPU 0 with two threads.
    let a = mk_thread(1, 2);
    let b = mk_thread(2, 2);
    f.set.enqueue_on(&a, 0);
    f.set.enqueue_on(&b, 0);

    let c = mk_thread(3, 2);
    f.set.enqueue(&c);
    assert_eq!(c.last_ran(), 1, "new thread lands on the empty CPU");
}

#[test]
fn cross_cpu_enqueue_fires_ipi() {
    let f = fixture(2);
    let ipi = Arc::new(CountingIpi(AtomicUsize::new(0)));
    f.set.set_ipi_sender(ipi.clone());

    let t = mk_thread(1, 2);
    f.set.enqueue_on(&t, 1);
    assert!(ipi.0.load(Ordering::Relaxed) >= 1);
}

#[test]
fn queue_bitmap_tracks_nonempty_classes() {
    let f = fixture(1);
    let sched = f.set.scheduler(0);
    assert_eq!(sched.bitmap(), 0);

    let ts = mk_thread(1, 1);
    f.set.enqueue_on(&ts, 0);
    assert_ne!(sched.bitmap() & (1 << PrioClass::Timeshare as u8), 0);

    let got = f.set.pick_next(0).unwrap();
    assert_eq!(got.id, 1);
    assert_eq!(sched.bitmap(), 0, "bit clears when the class empties");
}

#[test]
fn idle_mask_follows_pick() {
    let f = fixture(1);
    assert!(f.set.pick_next(0).is_none());
    assert!(f.set.topology().cpu_is_idle(0));

    let t = mk_thread(1, 1);
    f.set.enqueue_on(&t, 0);
    assert!(!f.set.topology().cpu_is_idle(0));
}

#[test]
fn tick_retires_thread_when_budget_exhausted() {
    let f = fixture(1);
    let t = mk_thread(1, 1);
    f.set.enqueue_on(&t, 0);

    let running = f.set.pick_next(0).unwrap();
    assert_eq!(running.state(), ThreadState::Running);

    // Exhaust the virtual budget by running far past the period.
    f.clock.advance(1000);
    let action = f.set.tick(0);
    assert_eq!(action, TickAction::Resched);
    assert_eq!(t.state(), ThreadState::Ready);

    // The thread sits in the completed tree; the next pick swaps trees and
    // opens a fresh period.
    let again = f.set.pick_next(0).unwrap();
    assert_eq!(again.id, 1);
}

#[test]
fn yield_requeues_runnable_current() {
    let f = fixture(1);
    let a = mk_thread(1, 1);
    let b = mk_thread(2, 1);
    f.set.enqueue_on(&a, 0);
    f.set.enqueue_on(&b, 0);

    let first = f.set.pick_next(0).unwrap();
    let second = f.set.yield_now(0).unwrap();
    // The yielded thread went back on a queue; nothing was lost.
    assert!([1, 2].contains(&second.id));
    assert_eq!(f.set.scheduler(0).thread_count(), 1);
    let _ = first;
}

/// Idle push: one CPU bursts while the rest sit idle; after one push
/// cycle every CPU holds some of the burst.
#[test]
fn idle_push_spreads_burst() {
    let cpus = 8;
    let f = fixture(cpus);

    // Mark everyone else idle first.
    for cpu in 1..cpus {
        assert!(f.set.pick_next(cpu).is_none());
    }

    let mut threads = Vec::new();
    for id in 0..14 {
        let t = mk_thread(id + 1, cpus);
        f.set.enqueue_on(&t, 0);
        threads.push(t);
    }

    // Push cycles ripple the burst outward until no idle target remains.
    for _ in 0..4 {
        for cpu in 0..cpus {
            f.set.try_push_to_idle(cpu);
        }
    }

    let counts: Vec<usize> = (0..cpus).map(|c| f.set.scheduler(c).thread_count()).collect();
    let total: usize = counts.iter().sum();
    assert_eq!(total, 14, "no thread lost or duplicated");
    assert!(
        counts.iter().all(|c| (1..=3).contains(c)),
        "burst spread across the fleet: {counts:?}"
    );
}

#[test]
fn steal_takes_from_busiest_victim() {
    let f = fixture(2);
    for id in 0..6 {
        let t = mk_thread(id + 1, 2);
        f.set.enqueue_on(&t, 0);
    }

    // CPU 1 is empty and below average; it may steal.
    assert!(f.set.can_steal_work(1));
    let stolen = f.set.try_steal(1).expect("victim clearly above threshold");
    assert_eq!(stolen.last_ran(), 1);
    assert_eq!(f.set.scheduler(1).thread_count(), 1);
    assert_eq!(f.set.scheduler(0).thread_count(), 5);
}

#[test]
fn no_scheduler_steals_from_itself() {
    let f = fixture(1);
    for id in 0..4 {
        let t = mk_thread(id + 1, 1);
        f.set.enqueue_on(&t, 0);
    }
    assert!(f.set.try_steal(0).is_none());
}

#[test]
fn steal_respects_affinity() {
    let f = fixture(2);
    for id in 0..6 {
        let t = mk_thread(id + 1, 2);
        t.allowed_cpus.with_lock(|m| {
            m.clear_all();
            m.set(0);
        });
        f.set.enqueue_on(&t, 0);
    }
    assert!(
        f.set.try_steal(1).is_none(),
        "pinned threads must not be stolen"
    );
}

#[test]
fn migrate_moves_queued_thread() {
    let f = fixture(2);
    let t = mk_thread(1, 2);
    f.set.enqueue_on(&t, 0);

    f.set.migrate(&t, 1);
    assert_eq!(t.last_ran(), 1);
    assert_eq!(f.set.scheduler(0).thread_count(), 0);
    assert_eq!(f.set.scheduler(1).thread_count(), 1);
}

#[test]
fn exit_and_reap_release_thread() {
    let f = fixture(1);
    let t = mk_thread(7, 1);
    f.set.enqueue_on(&t, 0);

    let running = f.set.pick_next(0).unwrap();
    assert_eq!(running.id, 7);
    drop(running);

    f.set.exit_current(0);
    assert_eq!(t.state(), ThreadState::Zombie);

    // Grace has not elapsed yet; nothing to reap.
    assert!(f.set.reap(0).is_empty());

    // Our own handle still pins the thread even after the grace period.
    f.set.tick(0);
    assert!(f.set.reap(0).is_empty());

    drop(t);
    let freed = f.set.reap(0);
    assert_eq!(freed, vec![7]);
}

#[test]
fn wake_requeues_only_matching_source() {
    let f = fixture(1);
    let t = mk_thread(1, 1);
    f.set.enqueue_on(&t, 0);
    let running = f.set.pick_next(0).unwrap();

    f.set.block(
        &running,
        kernel_thread::BlockReason::Manual,
        kernel_thread::WaitType::Uninterruptible,
        0xAB,
    );
    f.set.yield_now(0);

    // Wrong source: the wake is refused.
    assert!(!f.set.wake(0, &t, kernel_thread::WakeReason::BlockingManual, PrioClass::Timeshare, 0xCD));
    assert_eq!(t.state(), ThreadState::Blocked);

    // Matching source wakes and requeues.
    assert!(f.set.wake(0, &t, kernel_thread::WakeReason::BlockingManual, PrioClass::Timeshare, 0xAB));
    assert_eq!(t.state(), ThreadState::Ready);
    assert_eq!(f.set.scheduler(0).thread_count(), 1);
}
