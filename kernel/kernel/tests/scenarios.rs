use std::sync::Arc;

use kernel::{Kernel, KernelConfig};
use kernel_domain::{AllocBehavior, AllocFlags};
use kernel_sched::TickAction;
use kernel_thread::{ActivityClass, ThreadRef, ThreadState};
use kernel_time::{Clock, ManualClock};

struct Sim {
    kernel: Arc<Kernel>,
    clock: Arc<ManualClock>,
}

fn boot(cpus: usize) -> Sim {
    let clock = Arc::new(ManualClock::new());
    let config = KernelConfig {
        clock: clock.clone(),
        ..KernelConfig::uniform(cpus)
    };
    Sim {
        kernel: Kernel::boot(config),
        clock,
    }
}

fn current_of(sim: &Sim, cpu: usize) -> Option<ThreadRef> {
    sim.kernel.sched.scheduler(cpu).queues.with_lock(|q| q.current.clone())
}

#[test]
fn boot_allocates_and_frees_through_the_whole_stack() {
    let sim = boot(2);
    let k = &sim.kernel;

    // Slab objects.
    let a = k.alloc(0, 100, AllocFlags::default(), AllocBehavior::MayFault).unwrap();
    let b = k.alloc(1, 100, AllocFlags::default(), AllocBehavior::MayFault).unwrap();
    assert_ne!(a, b);
    k.free(0, a, AllocBehavior::MayFault);
    k.free(1, b, AllocBehavior::MayFault);

    // Raw pages.
    let p = k.alloc_pages(0, 4, AllocFlags::default()).unwrap();
    k.free_pages(0, p, 4);

    assert!(k.slab.check_all());
}

#[test]
fn flush_worker_pass_drains_flagged_domains() {
    let sim = boot(1);
    let k = &sim.kernel;

    // Enough frees to trip the flush batch notifier.
    let mut pages = Vec::new();
    for _ in 0..40 {
        pages.push(k.alloc_pages(0, 1, AllocFlags::default()).unwrap());
    }
    for p in pages {
        k.free_pages(0, p, 1);
    }

    // The pass consumes whatever flags were raised; a second is a no-op.
    let _ = k.run_flush_pass();
    assert_eq!(k.run_flush_pass(), 0);
}

#[test]
fn thread_lifecycle_reuses_stack_and_id() {
    let sim = boot(1);
    let k = &sim.kernel;

    let t = k.thread_create(0, "worker", None, 0, 0).unwrap();
    let first_id = t.id;
    let first_stack = t.stack.0;
    assert!(t.stack.1 > 0);

    k.enqueue(&t);
    let running = k.yield_now(0).unwrap();
    assert_eq!(running.id, first_id);
    drop(running);

    k.exit_current(0);
    assert_eq!(t.state(), ThreadState::Zombie);

    // Tick to pass a quiescent point, then reap.
    sim.clock.advance(1);
    k.tick(0);
    k.release_thread(0, &t);
    drop(t);
    assert_eq!(k.reap(0), 1);

    // The released stack range and id come back.
    let t2 = k.thread_create(0, "worker2", None, 0, 0).unwrap();
    assert_eq!(t2.id, first_id);
    assert_eq!(t2.stack.0, first_stack);
}

/// Timeout precision: a sleeper armed for `n` milliseconds is not woken a
/// tick early, and wakes exactly when the clock reaches the deadline.
#[test]
fn sleep_wakes_no_earlier_than_requested() {
    let sim = boot(1);
    let k = &sim.kernel;

    let t = k.thread_create(0, "sleeper", None, 0, 0).unwrap();
    k.enqueue(&t);
    let current = k.yield_now(0).unwrap();
    assert!(Arc::ptr_eq(&current, &t));

    k.sleep_current_ms(0, &t, 50);
    assert_eq!(t.state(), ThreadState::Sleeping);

    sim.clock.advance(49);
    k.tick(0);
    assert_eq!(t.state(), ThreadState::Sleeping, "not a moment early");

    sim.clock.advance(1);
    k.tick(0);
    assert_eq!(t.state(), ThreadState::Ready);

    let woken = k.yield_now(0).unwrap();
    assert!(Arc::ptr_eq(&woken, &t));
}

/// An interactive thread that wakes every 50 ms and runs briefly holds a
/// modest share of one CPU against a CPU-bound hog, and its activity
/// class settles to interactive; the hog classifies as CPU bound.
#[test]
fn interactive_thread_keeps_share_against_cpu_hog() {
    let sim = boot(1);
    let k = &sim.kernel;

    let a = k.thread_create(0, "interactive", None, 0, 0).unwrap();
    let b = k.thread_create(0, "hog", None, 0, 0).unwrap();
    k.enqueue(&a);
    k.enqueue(&b);
    k.yield_now(0);

    const WAKE_PERIOD_MS: u64 = 50;
    const BURST_MS: u64 = 5;

    let mut a_runtime = 0u64;
    let mut a_burst = 0u64;

    for _ in 0..4000 {
        sim.clock.advance(1);
        let now = sim.clock.now_ms();

        let current = current_of(&sim, 0);
        let a_is_current = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &a));
        if a_is_current {
            a_runtime += 1;
            a_burst += 1;
        }

        // The interactive thread sleeps until its next 50 ms boundary
        // after a short burst of work.
        if a_is_current && a_burst >= BURST_MS {
            a_burst = 0;
            let next_wake = (now / WAKE_PERIOD_MS + 1) * WAKE_PERIOD_MS;
            k.sleep_current_ms(0, &a, next_wake - now);
        }

        if k.tick(0) == TickAction::Resched {
            k.yield_now(0);
        }
        if current_of(&sim, 0).is_none() {
            k.yield_now(0);
        }
    }

    let share_pct = a_runtime * 100 / 4000;
    assert!(
        (5..=50).contains(&share_pct),
        "interactive share out of band: {share_pct}%"
    );

    let a_class = a.sched.with_lock(|s| s.activity_class);
    assert_eq!(a_class, ActivityClass::Interactive);

    let b_class = b.sched.with_lock(|s| s.activity_class);
    assert_eq!(b_class, ActivityClass::CpuBound);
}

#[test]
fn condvar_timeout_returns_timeout_reason() {
    use kernel_thread::WakeReason;
    use std::sync::atomic::{AtomicBool, Ordering};

    let sim = boot(2);
    let k = Arc::clone(&sim.kernel);

    let m = Arc::new(k.mutex_create());
    let cv = Arc::new(k.condvar_create());

    let waiter = k.thread_create(1, "waiter", None, 0, 0).unwrap();
    k.enqueue(&waiter);
    let current = k.sched.pick_next(1).unwrap();
    assert!(Arc::ptr_eq(&current, &waiter));

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let (k, m, cv, waiter, done) = (
            Arc::clone(&k),
            Arc::clone(&m),
            Arc::clone(&cv),
            waiter.clone(),
            Arc::clone(&done),
        );
        std::thread::spawn(move || {
            m.lock(&k.sched, &k.turnstiles, 1, &waiter);
            let reason = k.condvar_wait_timeout(&cv, &m, 1, &waiter, 30);
            m.unlock(&k.sched, &k.turnstiles, 1, &waiter);
            done.store(true, Ordering::Release);
            reason
        })
    };

    // Drive time forward on CPU 0 until the timeout fires.
    for _ in 0..200 {
        if done.load(Ordering::Acquire) {
            break;
        }
        sim.clock.advance(5);
        k.tick(0);
        std::thread::yield_now();
    }

    let reason = handle.join().unwrap();
    assert_eq!(reason, WakeReason::Timeout);
    assert_eq!(cv.waiter_count(), 0);
}

#[test]
fn deferred_work_posts_to_local_queue() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static FIRED: AtomicUsize = AtomicUsize::new(0);
    fn record(a: usize, _b: usize) {
        FIRED.fetch_add(a, Ordering::SeqCst);
    }

    let sim = boot(1);
    let k = &sim.kernel;
    k.workqueues.local(0).add_worker(None, 0, true);

    k.defer_enqueue(0, record, kernel_workqueue::WorkArgs::new(7, 0), 25);
    sim.clock.advance(10);
    k.tick(0);
    k.workqueues.local(0).worker_pass(0, sim.clock.now_ms());
    assert_eq!(FIRED.load(Ordering::SeqCst), 0, "not due yet");

    sim.clock.advance(20);
    k.tick(0);
    k.workqueues.local(0).worker_pass(0, sim.clock.now_ms());
    assert_eq!(FIRED.load(Ordering::SeqCst), 7);
}
