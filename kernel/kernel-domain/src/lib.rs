//! # NUMA-domain physical allocator
//!
//! The domain layer partitions physical memory between NUMA domains and puts
//! two caches in front of every domain's buddy zone:
//!
//! * **per-core page arenas** — bounded rings of single free pages, popped
//!   and pushed without touching the buddy lock;
//! * **a per-domain free queue** — a bounded ring of pending frees that
//!   remote CPUs use instead of taking a remote buddy lock, drained by the
//!   owning domain's flush worker.
//!
//! Allocation takes a page count and an [`AllocFlags`] word carrying a
//! locality degree and modifiers. The search order is: local arena, local
//! free-queue drain, peer arenas, then either the interleave cursor or a
//! distance/free-pages scored walk of the zonelist. Exhaustion returns
//! `None`; the slab layer above decides whether to GC and retry.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;
mod domain;
mod flags;
mod free_queue;
mod set;
mod stats;
mod zonelist;

pub use arena::PageArena;
pub use domain::DomainBuddy;
pub use flags::{AllocBehavior, AllocFlags, AllocOpts, LOCALITY_MAX, LOCALITY_MIN};
pub use free_queue::DomainFreeQueue;
pub use set::{DomainSet, FlushNotify};
pub use stats::DomainStats;
pub use zonelist::{Zonelist, ZonelistEntry};

/// Distance dominates the zonelist score.
pub(crate) const DISTANCE_WEIGHT: i64 = 1000;
/// Free pages count against the score, weakly.
pub(crate) const FREE_PAGES_WEIGHT: i64 = 1;

/// Arena scale: 1 % of domain pages per core.
pub(crate) const ARENA_SCALE_PERMILLE: u64 = 10;
/// Free-queue scale: 0.5 % of total pages per domain.
pub(crate) const FREEQUEUE_SCALE_PERMILLE: u64 = 5;
