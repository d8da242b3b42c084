//! # Low-level synchronization primitives
//!
//! Spin-based primitives shared by every other core crate: the raw spinlock,
//! an RAII [`SpinLock`] container, the IRQL ladder used to gate preemption,
//! and a once-cell for the boot-published global.
//!
//! Nothing here ever sleeps. The blocking primitives (mutex, rwlock,
//! condvar) live above the scheduler and are built from these pieces.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod irql;
mod raw_spin;
mod spin_lock;
mod sync_once_cell;

pub use irql::{IrqLevel, IrqState, IrqlGuard};
pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
