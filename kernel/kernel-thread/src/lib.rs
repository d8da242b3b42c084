//! # Thread objects
//!
//! The kernel execution context and everything the scheduler knows about
//! it: lifecycle state, placement, priority inputs, activity history and
//! the block/wake handshake.
//!
//! Threads are reference-counted ([`ThreadRef`]); the scheduler, wait
//! queues and reaper all hold clones of the same `Arc`. Hot fields are
//! atomics; the rest sits behind the per-thread spinlock, which by
//! convention is acquired only after the scheduler lock that governs the
//! thread.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod activity;
pub mod fair;
mod id;
mod state;
mod thread;

pub use id::IdAllocator;
pub use state::{
    ActivityClass, BlockReason, PrioClass, QueueResidence, SleepReason, ThreadFlags, ThreadState,
    WaitType, WakeReason,
};
pub use thread::{NO_TURNSTILE, Thread, ThreadEntry, ThreadRef, ThreadSched};

/// Default timeslice before the first period assigns a real one.
pub const DEFAULT_TIMESLICE_MS: u64 = 15;

/// Default kernel stack size.
pub const DEFAULT_STACK_SIZE: u64 = 64 * 1024;
