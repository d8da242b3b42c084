//! Adaptive mutex with turnstile handoff.
//!
//! The lock word packs the owner id and the held/waiter bits. Acquisition
//! tries a CAS fastpath, then spins with jittered exponential backoff as
//! long as the owner is on a CPU, and finally parks on the lock's
//! turnstile once the owner stops running. Unlock wakes exactly one
//! writer-queue waiter.

use crate::delay::lock_delay;
use crate::turnstile::{LockKey, MUTEX_UNLOCK_WAKE_COUNT, TurnstileQueue, TurnstileTable};

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_cpumask::CpuId;
use kernel_sched::SchedulerSet;
use kernel_sync::SpinLock;
use kernel_thread::{ThreadRef, ThreadState};

/// Smallest backoff between acquisition attempts.
pub const MUTEX_BACKOFF_DEFAULT: u64 = 4;
/// Largest backoff: 2^22.
pub const MUTEX_BACKOFF_MAX: u64 = 1 << 22;
const MUTEX_BACKOFF_SHIFT: u32 = 1;
/// Jitter applied to every backoff delay.
pub const MUTEX_BACKOFF_JITTER_PCT: u64 = 15;

#[bitfield(u64)]
struct MutexWord {
    held: bool,
    waiter: bool,
    #[bits(6)]
    _reserved: u8,
    #[bits(56)]
    owner_id: u64,
}

/// Grows the backoff exponentially, saturating at the cap.
#[must_use]
pub fn next_backoff(current: u64) -> u64 {
    if current == 0 {
        return MUTEX_BACKOFF_DEFAULT;
    }
    if current >= MUTEX_BACKOFF_MAX >> MUTEX_BACKOFF_SHIFT {
        return MUTEX_BACKOFF_MAX;
    }
    (current << MUTEX_BACKOFF_SHIFT).min(MUTEX_BACKOFF_MAX)
}

/// A blocking mutex.
pub struct Mutex {
    word: AtomicU64,
    /// Owner handle mirror of the id packed in the word.
    owner: SpinLock<Option<ThreadRef>>,
    key: LockKey,
}

impl Mutex {
    #[must_use]
    pub fn new(table: &TurnstileTable) -> Self {
        Self {
            word: AtomicU64::new(0),
            owner: SpinLock::new(None),
            key: table.new_lock_key(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> LockKey {
        self.key
    }

    fn read_word(&self) -> MutexWord {
        MutexWord::from_bits(self.word.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn owner(&self) -> Option<ThreadRef> {
        self.owner.with_lock(|o| o.clone())
    }

    #[must_use]
    pub fn owner_id(&self) -> Option<u64> {
        let w = self.read_word();
        w.held().then(|| w.owner_id())
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.read_word().held()
    }

    fn owner_running(&self) -> bool {
        self.owner()
            .is_some_and(|t| t.state() == ThreadState::Running)
    }

    /// CAS fastpath; succeeds only from the fully-unlocked word.
    pub fn try_lock(&self, current: &ThreadRef) -> bool {
        let new = MutexWord::new()
            .with_held(true)
            .with_owner_id(current.id)
            .into_bits();
        if self
            .word
            .compare_exchange(0, new, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        *self.owner.lock() = Some(current.clone());
        true
    }

    fn set_waiter_bit(&self) {
        self.word
            .fetch_or(MutexWord::new().with_waiter(true).into_bits(), Ordering::AcqRel);
    }

    fn waiter_bit(&self) -> bool {
        self.read_word().waiter()
    }

    /// Acquires the mutex on behalf of `current`, running on `cpu`.
    ///
    /// The slow path alternates between backoff spinning while the owner
    /// is on a CPU and turnstile blocking once it is not; the backoff
    /// resets after `core_count` observed owner changes so a contended
    /// caller is not starved by its own politeness.
    pub fn lock(&self, set: &SchedulerSet, table: &TurnstileTable, cpu: CpuId, current: &ThreadRef) {
        // Pin against stealing for the duration of the acquisition dance.
        let pin_flags = current.or_flags(kernel_thread::ThreadFlags::NO_STEAL);

        if self.try_lock(current) {
            current.set_flags(pin_flags);
            table.set_inheritor(self.key, current);
            return;
        }

        let mut last_owner = self.owner_id();
        let mut backoff = MUTEX_BACKOFF_DEFAULT;
        let mut owner_changes = 0usize;

        loop {
            lock_delay(backoff, MUTEX_BACKOFF_JITTER_PCT);

            let current_owner = self.owner_id();
            match current_owner {
                None => {
                    if self.try_lock(current) {
                        break;
                    }
                    backoff = next_backoff(backoff);
                    owner_changes += 1;
                    continue;
                }
                Some(o) if last_owner != Some(o) => {
                    last_owner = Some(o);
                    backoff = next_backoff(backoff);
                    owner_changes += 1;
                }
                _ => {}
            }

            if owner_changes >= set.cpu_count() {
                backoff = MUTEX_BACKOFF_DEFAULT;
                owner_changes = 0;
            }

            // Keep spinning while the owner makes progress on a CPU.
            if self.owner_running() {
                continue;
            }

            // The waiter bit must be set before re-verifying the owner.
            self.set_waiter_bit();

            if self.owner_running() {
                continue;
            }

            let owner = self.owner();
            let blocked = table.block_if(
                set,
                cpu,
                current,
                self.key,
                TurnstileQueue::Writer,
                owner,
                || self.owner_id() == current_owner && self.waiter_bit(),
            );
            if blocked {
                // Woken: the lock was freed for us; go again.
                backoff = MUTEX_BACKOFF_DEFAULT;
                owner_changes = 0;
                if self.try_lock(current) {
                    break;
                }
            }
        }

        debug_assert_eq!(self.owner_id(), Some(current.id));
        current.set_flags(pin_flags);
        table.set_inheritor(self.key, current);
    }

    /// Releases the mutex.
    ///
    /// # Panics
    /// Panics when called by a thread that does not own the lock.
    pub fn unlock(
        &self,
        set: &SchedulerSet,
        table: &TurnstileTable,
        cpu: CpuId,
        current: &ThreadRef,
    ) {
        let w = self.read_word();
        assert!(
            w.held() && w.owner_id() == current.id,
            "non-owner thread tried to unlock mutex: owner id {:?}, current {}",
            self.owner_id(),
            current.id
        );

        let had_waiters = w.waiter();
        if !had_waiters {
            *self.owner.lock() = None;
            self.word.store(0, Ordering::Release);
            return;
        }

        // Clear the word under the chain lock so a late blocker backs out
        // instead of parking behind this wake. Leftover waiters re-arm the
        // bit when they block again; the woken thread re-CASes the word.
        let woken = table.wake_with(
            set,
            cpu,
            current,
            self.key,
            TurnstileQueue::Writer,
            MUTEX_UNLOCK_WAKE_COUNT,
            || {
                *self.owner.lock() = None;
                self.word.store(0, Ordering::Release);
            },
        );
        if woken.is_empty() && table.is_boosted(current) {
            // Every waiter cancelled before we got here; drop the boost
            // they left behind.
            table.uninherit(current);
        }
    }
}
