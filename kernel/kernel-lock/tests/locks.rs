use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use kernel_lock::{Condvar, Mutex, RwAcquire, RwLock, Semaphore, TurnstileTable};
use kernel_sched::SchedulerSet;
use kernel_thread::{PrioClass, Thread, ThreadRef};
use kernel_time::ManualClock;
use kernel_topology::{Topology, TopologySpec};

struct World {
    set: Arc<SchedulerSet>,
    table: Arc<TurnstileTable>,
}

fn world(cpus: usize) -> World {
    let topo = Arc::new(Topology::build(&TopologySpec::uniform(cpus)));
    let clock = Arc::new(ManualClock::new());
    World {
        set: Arc::new(SchedulerSet::new(topo, clock, 7)),
        table: Arc::new(TurnstileTable::new()),
    }
}

fn spawn_kthread(w: &World, id: u64, cpu: usize) -> ThreadRef {
    let t = Thread::new(id, format!("t{id}"), None, 0, (0, 0), w.set.cpu_count(), cpu, 0);
    w.set.enqueue_on(&t, cpu);
    let picked = w.set.pick_next(cpu).expect("just enqueued");
    assert!(Arc::ptr_eq(&picked, &t));
    t
}

/// Bounded poll so a broken handshake fails the test instead of hanging.
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500_000 {
        if cond() {
            return;
        }
        thread::yield_now();
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn mutex_fastpath_and_exclusion() {
    let w = world(1);
    let m = Mutex::new(&w.table);
    let a = spawn_kthread(&w, 1, 0);

    assert!(m.try_lock(&a));
    assert_eq!(m.owner_id(), Some(1));
    assert!(!m.try_lock(&a), "held mutex rejects try_lock");

    m.unlock(&w.set, &w.table, 0, &a);
    assert!(!m.is_held());
}

#[test]
#[should_panic(expected = "non-owner")]
fn mutex_unlock_by_non_owner_panics() {
    let w = world(2);
    let m = Mutex::new(&w.table);
    let a = spawn_kthread(&w, 1, 0);
    let b = spawn_kthread(&w, 2, 1);

    assert!(m.try_lock(&a));
    m.unlock(&w.set, &w.table, 1, &b);
}

/// Priority inheritance end to end: a background owner holds the mutex, an
/// urgent blocker contends. The owner is boosted to urgent while the
/// blocker waits and reverts after unlocking; the blocker ends up owning
/// the mutex.
#[test]
fn mutex_priority_inheritance_handoff() {
    let w = world(2);
    let m = Arc::new(Mutex::new(&w.table));

    let owner = spawn_kthread(&w, 1, 0);
    owner.set_background();
    let blocker = spawn_kthread(&w, 2, 1);
    blocker.set_urgent();

    assert!(m.try_lock(&owner));
    // The owner leaves the CPU so the blocker stops spinning and parks.
    w.set.yield_now(0);

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let (w_set, w_table) = (Arc::clone(&w.set), Arc::clone(&w.table));
        let (m, blocker, done) = (Arc::clone(&m), blocker.clone(), Arc::clone(&done));
        thread::spawn(move || {
            m.lock(&w_set, &w_table, 1, &blocker);
            assert_eq!(m.owner_id(), Some(2), "handoff reached the blocker");
            m.unlock(&w_set, &w_table, 1, &blocker);
            done.store(true, Ordering::Release);
        })
    };

    // Wait until the blocker is parked and the boost has propagated.
    wait_until("blocker parked", || w.table.waiter_count(m.key()) == 1);
    wait_until("owner boosted", || {
        owner.perceived_class() == PrioClass::Urgent
    });

    assert_eq!(
        owner.perceived_class(),
        PrioClass::Urgent,
        "owner inherited the blocker's class"
    );

    m.unlock(&w.set, &w.table, 0, &owner);
    assert_eq!(
        owner.perceived_class(),
        PrioClass::Background,
        "boost reverted on unlock"
    );

    handle.join().unwrap();
    assert!(done.load(Ordering::Acquire));
    assert!(!m.is_held());
    assert_eq!(w.table.waiter_count(m.key()), 0);
}

#[test]
fn rwlock_readers_share_writers_exclude() {
    let w = world(2);
    let l = RwLock::new(&w.table, PrioClass::Rt);
    let r1 = spawn_kthread(&w, 1, 0);
    let r2 = spawn_kthread(&w, 2, 1);

    assert!(l.try_lock(&r1, RwAcquire::Read));
    assert!(l.try_lock(&r2, RwAcquire::Read));
    assert_eq!(l.reader_count(), 2);

    assert!(!l.try_lock(&r1, RwAcquire::Write), "readers block writers");

    l.unlock(&w.set, &w.table, 0, &r1);
    l.unlock(&w.set, &w.table, 1, &r2);
    assert_eq!(l.reader_count(), 0);

    assert!(l.try_lock(&r1, RwAcquire::Write));
    assert_eq!(l.write_owner_id(), Some(1));
    assert!(!l.try_lock(&r2, RwAcquire::Read), "writer blocks readers");
    l.unlock(&w.set, &w.table, 0, &r1);
}

#[test]
#[should_panic(expected = "no readers left")]
fn rwlock_double_read_unlock_panics() {
    let w = world(1);
    let l = RwLock::new(&w.table, PrioClass::Rt);
    let t = spawn_kthread(&w, 1, 0);

    assert!(l.try_lock(&t, RwAcquire::Read));
    l.unlock(&w.set, &w.table, 0, &t);
    l.unlock(&w.set, &w.table, 0, &t);
}

/// A pending writer denies new readers and eventually receives the lock by
/// direct handoff once the last reader leaves.
#[test]
fn rwlock_pending_writer_denies_new_readers() {
    let w = world(2);
    let l = Arc::new(RwLock::new(&w.table, PrioClass::Rt));

    let reader = spawn_kthread(&w, 1, 0);
    let writer = spawn_kthread(&w, 2, 1);

    assert!(l.try_lock(&reader, RwAcquire::Read));
    w.set.yield_now(0);

    let handle = {
        let (w_set, w_table) = (Arc::clone(&w.set), Arc::clone(&w.table));
        let (l, writer) = (Arc::clone(&l), writer.clone());
        thread::spawn(move || {
            l.lock(&w_set, &w_table, 1, &writer, RwAcquire::Write);
            assert_eq!(l.write_owner_id(), Some(2));
            l.unlock(&w_set, &w_table, 1, &writer);
        })
    };

    wait_until("writer pending", || {
        l.writer_pending() && w.table.waiter_count(l.key()) == 1
    });

    // New readers are refused while the writer waits.
    assert!(!l.try_lock(&reader, RwAcquire::Read));

    // The last reader leaving hands the lock to the writer.
    l.unlock(&w.set, &w.table, 0, &reader);
    handle.join().unwrap();

    assert!(l.write_owner_id().is_none());
    assert!(l.try_lock(&reader, RwAcquire::Read));
}

/// Two waiters of different classes: signal wakes the RT waiter first,
/// then the timeshare one.
#[test]
fn condvar_signals_by_priority() {
    let w = world(3);
    let m = Arc::new(Mutex::new(&w.table));
    let cv = Arc::new(Condvar::new(&w.table));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let w1 = spawn_kthread(&w, 1, 0);
    w1.set_rt();
    let w2 = spawn_kthread(&w, 2, 1);
    // w2 stays timeshare.

    let mut handles = Vec::new();
    for (t, cpu, tag) in [(w1.clone(), 0usize, "rt"), (w2.clone(), 1usize, "ts")] {
        let (w_set, w_table) = (Arc::clone(&w.set), Arc::clone(&w.table));
        let (m, cv, order) = (Arc::clone(&m), Arc::clone(&cv), Arc::clone(&order));
        handles.push(thread::spawn(move || {
            m.lock(&w_set, &w_table, cpu, &t);
            let reason = cv.wait(&w_set, &w_table, cpu, &t, &m);
            order.lock().unwrap().push((tag, reason));
            m.unlock(&w_set, &w_table, cpu, &t);
        }));
    }

    wait_until("both waiters parked", || cv.waiter_count() == 2);

    cv.signal(&w.set, 2);
    wait_until("first waiter processed", || {
        order.lock().unwrap().len() == 1
    });
    cv.signal(&w.set, 2);

    for h in handles {
        h.join().unwrap();
    }

    let order = order.lock().unwrap();
    assert_eq!(order[0].0, "rt", "higher perceived class wakes first");
    assert_eq!(order[1].0, "ts");
    assert!(
        order
            .iter()
            .all(|(_, r)| *r == kernel_thread::WakeReason::Signal)
    );
}

#[test]
fn semaphore_counts_and_blocks() {
    let w = world(2);
    let sem = Arc::new(Semaphore::new(&w.table, 1));

    let a = spawn_kthread(&w, 1, 0);
    let b = spawn_kthread(&w, 2, 1);

    sem.wait(&w.set, 0, &a);
    assert_eq!(sem.available(), 0);
    assert!(!sem.try_wait());

    let handle = {
        let (w_set, sem, b) = (Arc::clone(&w.set), Arc::clone(&sem), b.clone());
        thread::spawn(move || {
            sem.wait(&w_set, 1, &b);
        })
    };

    // Give the waiter a moment to park, then release.
    thread::sleep(Duration::from_millis(20));
    sem.post(&w.set, 0);
    handle.join().unwrap();
    assert_eq!(sem.available(), 0, "unit consumed by the woken waiter");
}
