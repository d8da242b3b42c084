//! Turnstiles: donated wait objects lent to contended locks.
//!
//! Every thread is born owning one turnstile. The first thread to block on
//! a lock donates its turnstile to carry the lock's wait queues; later
//! blockers drop theirs onto that turnstile's freelist. Each woken thread
//! leaves with a turnstile from the freelist, and the last one takes the
//! serving turnstile with it, emptying the hash chain entry.
//!
//! Turnstiles are interchangeable, so donation is tracked as a token
//! transfer on the thread plus a freelist depth on the entry — the
//! observable protocol (entry lifetime, waiter counts, who leaves with
//! what) is exactly the donation scheme.
//!
//! Priority inheritance starts from the lock owner at block time and walks
//! the owner chain through `blocked_on`, boosting every owner whose
//! effective inputs are below the blocker's. A revisit of the original
//! blocker means a deadlocked cycle and panics.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_cpumask::CpuId;
use kernel_sched::SchedulerSet;
use kernel_sync::SpinLock;
use kernel_thread::fair::turnstile_priority;
use kernel_thread::{BlockReason, ThreadRef, WaitType, WakeReason};

/// Number of hash chains; operations on one lock serialize on its chain.
pub const TURNSTILE_HASH_SIZE: usize = 64;

/// Identity of a lock object in the turnstile table.
pub type LockKey = u64;

/// Waiter queues on a turnstile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnstileQueue {
    Reader = 0,
    Writer = 1,
}

type WaitKey = (i64, u64);

struct Entry {
    lock_obj: LockKey,
    waiters: usize,
    /// Donated turnstiles beyond the serving one.
    freelist: usize,
    applied_pi_boost: bool,
    /// Current owner of the lock, for priority propagation.
    owner: Option<ThreadRef>,
    queues: [BTreeMap<WaitKey, ThreadRef>; 2],
    seq: u64,
}

#[derive(Default)]
struct Chain {
    entries: Vec<Entry>,
}

/// The global turnstile hash table.
pub struct TurnstileTable {
    chains: Vec<SpinLock<Chain>>,
    key_counter: AtomicU64,
}

impl Default for TurnstileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnstileTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: (0..TURNSTILE_HASH_SIZE)
                .map(|_| SpinLock::new(Chain::default()))
                .collect(),
            key_counter: AtomicU64::new(1),
        }
    }

    /// Mints a unique key for a new lock object.
    pub fn new_lock_key(&self) -> LockKey {
        self.key_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn chain_for(&self, key: LockKey) -> &SpinLock<Chain> {
        // Fibonacci hash of the key into the chain array.
        let h = (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 58) as usize;
        &self.chains[h % TURNSTILE_HASH_SIZE]
    }

    /// Waiters currently parked on `key`.
    #[must_use]
    pub fn waiter_count(&self, key: LockKey) -> usize {
        self.chain_for(key).with_lock(|c| {
            c.entries
                .iter()
                .find(|e| e.lock_obj == key)
                .map_or(0, |e| e.waiters)
        })
    }

    /// Highest-priority waiter on one queue of `key`, if any.
    #[must_use]
    pub fn peek_waiter(&self, key: LockKey, queue: TurnstileQueue) -> Option<ThreadRef> {
        self.chain_for(key).with_lock(|c| {
            c.entries
                .iter()
                .find(|e| e.lock_obj == key)
                .and_then(|e| e.queues[queue as usize].last_key_value())
                .map(|(_, t)| t.clone())
        })
    }

    /// Walks the owner chain from `key`, boosting owners below the
    /// blocker's effective inputs. Records the boost on the entry so the
    /// eventual waker can un-inherit.
    ///
    /// # Panics
    /// Panics when the walk revisits the original blocker — a deadlocked
    /// ownership cycle.
    fn propagate_boost(&self, blocker: &ThreadRef, key: LockKey) {
        let (mut boost_class, mut boost_weight) = blocker
            .sched
            .with_lock(|s| (s.perceived_class, s.weight));
        let mut cur_key = key;

        loop {
            let owner = self.chain_for(cur_key).with_lock(|c| {
                let entry = c.entries.iter_mut().find(|e| e.lock_obj == cur_key)?;
                let owner = entry.owner.clone()?;

                if Arc::ptr_eq(&owner, blocker) {
                    panic!("turnstile waiter cycle deadlock on lock {cur_key:#x}");
                }

                let boosted = owner.sched.with_lock(|s| {
                    if s.weight >= boost_weight && s.perceived_class >= boost_class {
                        return false;
                    }
                    if s.saved_class.is_none() {
                        s.saved_class = Some(s.perceived_class);
                        s.saved_weight = s.weight;
                    }
                    s.perceived_class = s.perceived_class.max(boost_class);
                    s.weight = s.weight.max(boost_weight);
                    s.boost_count += 1;
                    true
                });
                if boosted {
                    entry.applied_pi_boost = true;
                    log::debug!(
                        "pi: thread {} boosted toward {:?} by thread {}",
                        owner.id,
                        boost_class,
                        blocker.id
                    );
                }
                Some(owner)
            });

            let Some(owner) = owner else { break };
            let next = owner.blocked_on.load(Ordering::Acquire);
            if next == 0 {
                break;
            }
            (boost_class, boost_weight) = owner
                .sched
                .with_lock(|s| (s.perceived_class, s.weight));
            cur_key = next;
        }
    }

    /// Blocks `current` (running on `cpu`) on `key`, donating its
    /// turnstile, propagating priority through `owner`, and yielding. The
    /// call returns once a waker has handed the lock over.
    pub fn block(
        &self,
        set: &SchedulerSet,
        cpu: CpuId,
        current: &ThreadRef,
        key: LockKey,
        queue: TurnstileQueue,
        owner: Option<ThreadRef>,
    ) {
        let blocked = self.block_if(set, cpu, current, key, queue, owner, || true);
        debug_assert!(blocked);
    }

    /// Like [`block`](Self::block), but re-evaluates `precondition` under
    /// the chain lock before committing. A releaser serializes on the same
    /// chain lock, so a waiter whose condition evaporated never parks —
    /// this is what makes the waiter-bit protocol race-free.
    ///
    /// Returns whether the thread actually blocked.
    #[allow(clippy::too_many_arguments)]
    pub fn block_if(
        &self,
        set: &SchedulerSet,
        cpu: CpuId,
        current: &ThreadRef,
        key: LockKey,
        queue: TurnstileQueue,
        owner: Option<ThreadRef>,
        precondition: impl FnOnce() -> bool,
    ) -> bool {
        let prio = current
            .sched
            .with_lock(|s| turnstile_priority(s.perceived_class, s.weight));

        let committed = self.chain_for(key).with_lock(|c| {
            if !precondition() {
                return false;
            }

            // Declare ourselves blocked before we become visible on the
            // queue, so a waker never pops a still-runnable thread.
            set.block(current, BlockReason::Manual, WaitType::Interruptible, key);

            let idx = match c.entries.iter().position(|e| e.lock_obj == key) {
                Some(i) => {
                    // Someone already donated; ours joins the freelist.
                    debug_assert!(c.entries[i].waiters > 0);
                    c.entries[i].freelist += 1;
                    i
                }
                None => {
                    c.entries.push(Entry {
                        lock_obj: key,
                        waiters: 0,
                        freelist: 0,
                        applied_pi_boost: false,
                        owner: None,
                        queues: [BTreeMap::new(), BTreeMap::new()],
                        seq: 0,
                    });
                    c.entries.len() - 1
                }
            };
            let entry = &mut c.entries[idx];

            if owner.is_some() {
                entry.owner = owner;
            }
            entry.seq += 1;
            let seq = entry.seq;
            entry.queues[queue as usize].insert((prio, seq), current.clone());
            entry.waiters += 1;
            current.blocked_on.store(key, Ordering::Release);
            true
        });

        if !committed {
            return false;
        }

        self.propagate_boost(current, key);

        set.yield_now(cpu);
        // Past the suspension point: wakers may requeue us now.
        current.yielded_after_wait.store(true, Ordering::Release);
        current.wait_for_wake_match();
        set.resume_after_wake(cpu, current);

        current.blocked_on.store(0, Ordering::Release);
        true
    }

    /// Un-inherits the boost `releaser` may be carrying for `key` and wakes
    /// up to `count` threads from one queue, highest priority first. The
    /// last waiter takes the turnstile (and the chain entry) with it.
    ///
    /// Returns the threads woken.
    pub fn wake(
        &self,
        set: &SchedulerSet,
        waker_cpu: CpuId,
        releaser: &ThreadRef,
        key: LockKey,
        queue: TurnstileQueue,
        count: usize,
    ) -> Vec<ThreadRef> {
        self.wake_with(set, waker_cpu, releaser, key, queue, count, || {})
    }

    /// Like [`wake`](Self::wake), but runs `release` under the chain lock
    /// before the queue is popped. Lock words are cleared or handed off in
    /// that closure, so a concurrent `block_if` observes the release and
    /// backs out instead of parking behind a wake that already happened.
    #[allow(clippy::too_many_arguments)]
    pub fn wake_with(
        &self,
        set: &SchedulerSet,
        waker_cpu: CpuId,
        releaser: &ThreadRef,
        key: LockKey,
        queue: TurnstileQueue,
        count: usize,
        release: impl FnOnce(),
    ) -> Vec<ThreadRef> {
        let to_wake = self.chain_for(key).with_lock(|c| {
            release();

            let Some(idx) = c.entries.iter().position(|e| e.lock_obj == key) else {
                return Vec::new();
            };

            // Give back what we inherited before anyone else runs.
            if c.entries[idx].applied_pi_boost {
                c.entries[idx].applied_pi_boost = false;
                releaser.sched.with_lock(|s| {
                    if let Some(saved) = s.saved_class.take() {
                        s.perceived_class = saved;
                        s.weight = s.saved_weight;
                    }
                });
            }

            let mut woken = Vec::new();
            for _ in 0..count {
                let entry = &mut c.entries[idx];
                let Some((_, t)) = entry.queues[queue as usize].pop_last() else {
                    break;
                };
                entry.waiters -= 1;
                if entry.waiters == 0 {
                    // Last waiter takes the serving turnstile with it.
                    debug_assert_eq!(entry.freelist, 0);
                    c.entries.swap_remove(idx);
                    woken.push(t);
                    break;
                }
                debug_assert!(entry.freelist > 0);
                entry.freelist -= 1;
                woken.push(t);
            }
            woken
        });

        for t in &to_wake {
            let prio = t.perceived_class();
            set.wake(waker_cpu, t, WakeReason::BlockingManual, prio, key);
        }
        to_wake
    }

    /// Removes a specific waiter (timeout path). Returns whether it was
    /// still queued.
    pub fn cancel_wait(&self, t: &ThreadRef, key: LockKey, queue: TurnstileQueue) -> bool {
        self.chain_for(key).with_lock(|c| {
            let Some(idx) = c.entries.iter().position(|e| e.lock_obj == key) else {
                return false;
            };
            let entry = &mut c.entries[idx];
            let q = &mut entry.queues[queue as usize];
            let Some(k) = q
                .iter()
                .find(|(_, v)| Arc::ptr_eq(v, t))
                .map(|(k, _)| *k)
            else {
                return false;
            };
            q.remove(&k);
            entry.waiters -= 1;
            if entry.waiters == 0 {
                c.entries.swap_remove(idx);
            } else {
                entry.freelist -= 1;
            }
            true
        })
    }

    /// Updates the recorded owner of `key` after a handoff, so future
    /// blockers propagate into the right thread.
    pub fn set_inheritor(&self, key: LockKey, owner: &ThreadRef) {
        self.chain_for(key).with_lock(|c| {
            if let Some(e) = c.entries.iter_mut().find(|e| e.lock_obj == key) {
                e.owner = Some(owner.clone());
            }
        });
    }

    /// Wakes every reader whose priority is not below the best waiting
    /// writer; used by the rwlock unlock path. Returns how many readers
    /// qualify without waking them (the caller adjusts the lock word
    /// first).
    #[must_use]
    pub fn readers_beating_writers(&self, key: LockKey) -> usize {
        self.chain_for(key).with_lock(|c| {
            let Some(e) = c.entries.iter().find(|e| e.lock_obj == key) else {
                return 0;
            };
            let best_writer = e.queues[TurnstileQueue::Writer as usize]
                .last_key_value()
                .map_or(i64::MIN, |((p, _), _)| *p);
            e.queues[TurnstileQueue::Reader as usize]
                .iter()
                .rev()
                .take_while(|((p, _), _)| *p >= best_writer)
                .count()
        })
    }

    /// Whether any writer waits on `key`.
    #[must_use]
    pub fn has_waiting_writer(&self, key: LockKey) -> bool {
        self.peek_waiter(key, TurnstileQueue::Writer).is_some()
    }

    /// Number of waiters on one queue of `key`.
    #[must_use]
    pub fn queue_len(&self, key: LockKey, queue: TurnstileQueue) -> usize {
        self.chain_for(key).with_lock(|c| {
            c.entries
                .iter()
                .find(|e| e.lock_obj == key)
                .map_or(0, |e| e.queues[queue as usize].len())
        })
    }
}

/// Per-class count used when a blocker must decide how many threads an
/// unlock hands off to; mutexes always wake exactly one.
pub const MUTEX_UNLOCK_WAKE_COUNT: usize = 1;

impl TurnstileTable {
    /// Restores a thread's saved priority if a boost is still applied
    /// outside the wake path (e.g. an owner releasing with no waiters
    /// left after a cancel).
    pub fn uninherit(&self, t: &ThreadRef) {
        t.sched.with_lock(|s| {
            if let Some(saved) = s.saved_class.take() {
                s.perceived_class = saved;
                s.weight = s.saved_weight;
            }
        });
    }

    /// True when the saved-priority slot is armed, i.e. `t` currently
    /// carries an inherited priority.
    #[must_use]
    pub fn is_boosted(&self, t: &ThreadRef) -> bool {
        t.sched.with_lock(|s| s.saved_class.is_some())
    }

    /// Priority a thread presents to turnstile queues right now.
    #[must_use]
    pub fn queue_priority(t: &ThreadRef) -> i64 {
        t.sched
            .with_lock(|s| turnstile_priority(s.perceived_class, s.weight))
    }
}
