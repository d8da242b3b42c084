//! # Blocking synchronization primitives
//!
//! The mutex, reader-writer lock, condition variable and semaphore, all
//! built over the turnstile table and the scheduler's wake protocol.
//!
//! Priority inheritance flows through the turnstiles: a blocker boosts the
//! lock owner (and the chain it is blocked on) to its own class and
//! weight; the eventual releaser gives the boost back before waking
//! anyone. An ownership cycle panics — it is a deadlock, not a state to
//! recover from.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod condvar;
mod delay;
mod mutex;
mod rwlock;
mod semaphore;
mod turnstile;

pub use condvar::Condvar;
pub use delay::lock_delay;
pub use mutex::{MUTEX_BACKOFF_DEFAULT, MUTEX_BACKOFF_MAX, Mutex, next_backoff};
pub use rwlock::{RwAcquire, RwLock};
pub use semaphore::Semaphore;
pub use turnstile::{
    LockKey, MUTEX_UNLOCK_WAKE_COUNT, TURNSTILE_HASH_SIZE, TurnstileQueue, TurnstileTable,
};
