//! Reader-writer lock with direct handoff and a priority ceiling.
//!
//! Word layout: HELD (bit 0), priority-ceiling class (bits 1–2), WAITER
//! (bit 3), WRITER_WANT (bit 4); bits 5 and up carry the reader count, or
//! the exclusive owner's id while HELD is set.
//!
//! A pending writer sets WRITER_WANT before blocking, denying new readers.
//! Unlock hands the lock directly to the next writer, or to every reader
//! whose priority beats the best waiting writer; the published word
//! already reflects the woken set. The ceiling class is applied on acquire
//! and dropped on release.

use crate::delay::lock_delay;
use crate::turnstile::{LockKey, TurnstileQueue, TurnstileTable};

use core::sync::atomic::{AtomicU64, Ordering};
use kernel_cpumask::CpuId;
use kernel_sched::SchedulerSet;
use kernel_sync::SpinLock;
use kernel_thread::{PrioClass, ThreadRef};

const HELD: u64 = 1 << 0;
const CEIL_SHIFT: u32 = 1;
const CEIL_MASK: u64 = 0b11 << CEIL_SHIFT;
const WAITER: u64 = 1 << 3;
const WRITER_WANT: u64 = 1 << 4;
const COUNT_SHIFT: u32 = 5;
const COUNT_ONE: u64 = 1 << COUNT_SHIFT;
const COUNT_MASK: u64 = !(COUNT_ONE - 1);

const BACKOFF_DEFAULT: u64 = 4;
const BACKOFF_MAX: u64 = 1 << 22;
const BACKOFF_JITTER_PCT: u64 = 15;

/// Which side of the lock is being acquired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwAcquire {
    Read,
    Write,
}

/// The reader-writer lock.
pub struct RwLock {
    word: AtomicU64,
    /// Mirror of the exclusive owner packed into the word.
    owner: SpinLock<Option<ThreadRef>>,
    key: LockKey,
}

fn next_backoff(current: u64) -> u64 {
    if current >= BACKOFF_MAX >> 1 {
        BACKOFF_MAX
    } else {
        (current << 1).max(BACKOFF_DEFAULT)
    }
}

impl RwLock {
    /// Creates the lock with a priority ceiling.
    ///
    /// # Panics
    /// Panics on a background ceiling; the ceiling must be boostable.
    #[must_use]
    pub fn new(table: &TurnstileTable, ceiling: PrioClass) -> Self {
        assert!(
            ceiling != PrioClass::Background,
            "rwlock prio ceiling cannot be background"
        );
        Self {
            word: AtomicU64::new(u64::from(ceiling as u8) << CEIL_SHIFT),
            owner: SpinLock::new(None),
            key: table.new_lock_key(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> LockKey {
        self.key
    }

    fn read_word(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    fn ceiling(&self) -> PrioClass {
        PrioClass::from_raw(((self.read_word() & CEIL_MASK) >> CEIL_SHIFT) as u8)
    }

    #[must_use]
    pub fn reader_count(&self) -> u64 {
        let w = self.read_word();
        if w & HELD != 0 { 0 } else { w >> COUNT_SHIFT }
    }

    /// Whether a writer has announced itself and is keeping readers out.
    #[must_use]
    pub fn writer_pending(&self) -> bool {
        self.read_word() & WRITER_WANT != 0
    }

    #[must_use]
    pub fn write_owner_id(&self) -> Option<u64> {
        let w = self.read_word();
        (w & HELD != 0).then(|| w >> COUNT_SHIFT)
    }

    fn busy_mask(acq: RwAcquire) -> u64 {
        match acq {
            // Readers are kept out by a writer holding or wanting the lock.
            RwAcquire::Read => HELD | WRITER_WANT,
            // Writers are kept out by any occupant; a writer-held word has
            // its owner in the count bits, so the count mask covers both.
            RwAcquire::Write => COUNT_MASK | HELD,
        }
    }

    fn wait_bits(acq: RwAcquire) -> u64 {
        match acq {
            RwAcquire::Read => WAITER,
            RwAcquire::Write => WAITER | WRITER_WANT,
        }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self, current: &ThreadRef, acq: RwAcquire) -> bool {
        loop {
            let old = self.read_word();
            if old & Self::busy_mask(acq) != 0 {
                return false;
            }
            let new = match acq {
                RwAcquire::Read => old + COUNT_ONE,
                RwAcquire::Write => (old & !COUNT_MASK) | HELD | (current.id << COUNT_SHIFT),
            };
            if self
                .word
                .compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if acq == RwAcquire::Write {
                    *self.owner.lock() = Some(current.clone());
                }
                return true;
            }
        }
    }

    fn locked_with_type(&self, current: &ThreadRef, acq: RwAcquire) -> bool {
        let w = self.read_word();
        match acq {
            RwAcquire::Write => w & HELD != 0 && w >> COUNT_SHIFT == current.id,
            RwAcquire::Read => w & HELD == 0 && w & COUNT_MASK != 0,
        }
    }

    /// Acquires the lock for reading or writing, blocking on the turnstile
    /// when needed. The woken path relies on direct handoff: the unlocker
    /// has already written the word for us.
    pub fn lock(
        &self,
        set: &SchedulerSet,
        table: &TurnstileTable,
        cpu: CpuId,
        current: &ThreadRef,
        acq: RwAcquire,
    ) {
        if self.try_lock(current, acq) {
            if acq == RwAcquire::Write {
                table.set_inheritor(self.key, current);
            }
            current.boost_self(self.ceiling());
            return;
        }

        let busy = Self::busy_mask(acq);
        let wait_bits = Self::wait_bits(acq);
        let queue = match acq {
            RwAcquire::Read => TurnstileQueue::Reader,
            RwAcquire::Write => TurnstileQueue::Writer,
        };

        let mut backoff = BACKOFF_DEFAULT;
        let mut looped = 0usize;

        loop {
            let old = self.read_word();
            if old & busy == 0 {
                if self.try_lock(current, acq) {
                    break;
                }
                backoff = next_backoff(backoff);
                lock_delay(backoff, BACKOFF_JITTER_PCT);
                looped += 1;
                if looped == set.cpu_count() {
                    backoff = BACKOFF_DEFAULT;
                    looped = 0;
                }
                continue;
            }

            if old & HELD != 0 && old >> COUNT_SHIFT == current.id {
                panic!("recursive rwlock acquisition by thread {}", current.id);
            }

            // Publish intent to wait, bailing if the lock frees up.
            let mut armed = false;
            loop {
                let w = self.read_word();
                if w & busy == 0 {
                    break;
                }
                if self
                    .word
                    .compare_exchange_weak(w, w | wait_bits, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    armed = true;
                    break;
                }
            }
            if !armed {
                continue;
            }

            let owner = self.owner.with_lock(|o| o.clone());
            let blocked = table.block_if(set, cpu, current, self.key, queue, owner, || {
                let w = self.read_word();
                w & busy != 0 && w & wait_bits == wait_bits
            });
            if !blocked {
                // The lock changed hands while we armed; start over.
                continue;
            }

            // Direct handoff: the unlocker published a word that already
            // includes us.
            assert!(
                self.locked_with_type(current, acq),
                "rwlock handoff left the word inconsistent"
            );
            if acq == RwAcquire::Write {
                *self.owner.lock() = Some(current.clone());
                table.set_inheritor(self.key, current);
            }
            current.boost_self(self.ceiling());
            return;
        }

        debug_assert!(self.locked_with_type(current, acq));
        current.boost_self(self.ceiling());
    }

    /// Releases the lock.
    ///
    /// # Panics
    /// Panics on unlock by a non-owner writer, or a reader unlock with no
    /// readers left (double unlock).
    pub fn unlock(
        &self,
        set: &SchedulerSet,
        table: &TurnstileTable,
        cpu: CpuId,
        current: &ThreadRef,
    ) {
        let snapshot = self.read_word();
        let to_sub = if snapshot & HELD != 0 {
            assert!(
                snapshot >> COUNT_SHIFT == current.id,
                "non-owner thread unlocked exclusive rwlock"
            );
            *self.owner.lock() = None;
            HELD | (current.id << COUNT_SHIFT)
        } else {
            assert!(
                snapshot & COUNT_MASK != 0,
                "reader unlocked with no readers left on lock"
            );
            COUNT_ONE
        };

        let mut backoff = BACKOFF_DEFAULT;
        let mut looped = 0usize;

        loop {
            let old = self.read_word();
            let new = old - to_sub;

            // Not the final exit, or nobody waits: just drop our share.
            if new & (COUNT_MASK | WAITER) != WAITER {
                if self
                    .word
                    .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                backoff = next_backoff(backoff);
                lock_delay(backoff, BACKOFF_JITTER_PCT);
                looped += 1;
                if looped == set.cpu_count() {
                    backoff = BACKOFF_DEFAULT;
                    looped = 0;
                }
                continue;
            }

            // Final exit with waiters: direct handoff.
            let writer = table.peek_waiter(self.key, TurnstileQueue::Writer);
            let readers_to_wake = table.readers_beating_writers(self.key);
            let waiters = table.waiter_count(self.key);
            let ceil = old & CEIL_MASK;

            if let Some(writer) = &writer
                && readers_to_wake == 0
            {
                let mut word = HELD | ceil | (writer.id << COUNT_SHIFT);
                if waiters > 1 {
                    word |= WAITER;
                }
                // A second writer queued behind this one keeps readers out.
                if table.queue_len(self.key, TurnstileQueue::Writer) > 1 {
                    word |= WRITER_WANT;
                }
                table.wake_with(set, cpu, current, self.key, TurnstileQueue::Writer, 1, || {
                    *self.owner.lock() = Some(writer.clone());
                    self.word.store(word, Ordering::Release);
                });
            } else {
                let mut word = ceil | (readers_to_wake as u64 * COUNT_ONE);
                if waiters > readers_to_wake {
                    word |= WAITER;
                }
                if writer.is_some() {
                    word |= WRITER_WANT;
                }
                table.wake_with(
                    set,
                    cpu,
                    current,
                    self.key,
                    TurnstileQueue::Reader,
                    readers_to_wake,
                    || self.word.store(word, Ordering::Release),
                );
            }
            break;
        }

        current.unboost_self();
    }
}
