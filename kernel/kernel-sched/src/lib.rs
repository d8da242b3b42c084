//! # Per-CPU thread scheduler
//!
//! A multi-class run queue per CPU with strict ordering between classes:
//! urgent and realtime are FIFO, timeshare lives in a pair of priority
//! trees (current period and completed), background only runs when
//! timeshare drains. Period accounting hands every timeshare thread a
//! weight-proportional budget each period and slices it by activity.
//!
//! Fleet-wide balancing works both ways: a loaded CPU pushes to idle peers
//! (NUMA-distance scaled), an underloaded CPU pulls from the busiest
//! victim under a concurrency-gated stealing protocol.
//!
//! CPUs are driven explicitly: the embedder calls
//! [`SchedulerSet::pick_next`], [`SchedulerSet::tick`] and
//! [`SchedulerSet::yield_now`] — there is no hidden dispatch loop. Blocked
//! threads synchronize with their wakers through the `yielded_after_wait`
//! / `wake_matched` handshake on the thread object.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod balance;
mod rcu;
mod rng;
mod scheduler;
mod set;
mod steal;

pub use rcu::RcuState;
pub use rng::JitterRng;
pub use scheduler::{RunQueues, Scheduler, TsKey};
pub use set::{IpiSender, SchedulerSet, TickAction};
