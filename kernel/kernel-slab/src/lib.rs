//! # Multi-class slab allocator
//!
//! The object allocator sitting on top of the domain page allocator. Seven
//! size classes, 16 through 1024 bytes in powers of two, each backed by
//! one-page slabs laid out as `{header | bitmap | padding | objects}`.
//!
//! Hot paths, in order:
//!
//! 1. **per-CPU magazines** — a bounded stack per (CPU, class), with a
//!    watermark reserving the last entries for non-pageable requests;
//! 2. **free-queue drain** — pending frees recycled straight back into the
//!    magazines when the behavior permits faulting;
//! 3. **cache search** — pageable and non-pageable zonelists scored by
//!    `distance·W − usable`, picking the cheapest cache with room;
//! 4. **slab creation** — the newest parked GC slab re-initialized under
//!    the needy cache, else a fresh page from the domain allocator;
//! 5. **emergency GC** — one aggressive pass and a retry before giving up.
//!
//! Requests larger than the top class take the multi-page path: virtually
//! contiguous pages with an in-memory page header carrying the magic,
//! page count, owning domain and pageability.
//!
//! Empty slabs park on a per-domain GC tree ordered by enqueue time;
//! passes recycle them into under-supplied classes or hand their pages
//! back to the buddy.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod allocator;
mod cache;
mod class;
mod free_queue;
mod gc;
mod magazine;
mod meta;
mod stats;

pub use allocator::{SlabAllocator, SlabConfig};
pub use cache::{CacheLists, DomainSlabs};
pub use class::{SlabLayout, class_size, size_to_class};
pub use free_queue::SlabFreeQueue;
pub use gc::{GcAggressiveness, GcFlags, GcOutcome, GcRequest};
pub use magazine::{Magazine, PerCpuMags};
pub use meta::{SlabMeta, SlabState};
pub use stats::SlabStats;

pub use kernel_domain::{AllocBehavior, AllocFlags, AllocOpts};

/// Bytes per page, mirrored from the buddy.
pub const PAGE_BYTES: u64 = kernel_buddy::PAGE_SIZE;

/// Smallest class: 2^4 = 16 bytes.
pub const SLAB_MIN_SHIFT: u32 = 4;
/// Largest class: 2^10 = 1024 bytes.
pub const SLAB_MAX_SHIFT: u32 = 10;
/// Number of size classes.
pub const SLAB_CLASS_COUNT: usize = (SLAB_MAX_SHIFT - SLAB_MIN_SHIFT + 1) as usize;

/// Object alignment inside a slab.
pub const SLAB_OBJ_ALIGN: u64 = 16;
/// Reserved header region at the start of every slab page.
pub const SLAB_HEADER_BYTES: u64 = 128;

/// Entries per per-CPU magazine.
pub const SLAB_MAG_ENTRIES: usize = 16;
/// Percentage of magazine entries reserved for non-pageable requests.
pub const SLAB_MAG_WATERMARK_PCT: usize = 25;
/// Magazine occupancy below which pageable requests are refused.
pub const SLAB_MAG_WATERMARK: usize = SLAB_MAG_ENTRIES * SLAB_MAG_WATERMARK_PCT / 100;

/// Portion of the free queue drained on an ordinary allocation miss.
pub const SLAB_FREE_QUEUE_ALLOC_PCT: u64 = 25;

/// Magic word of a multi-page allocation header.
pub const KMALLOC_PAGE_MAGIC: u64 = 0x4b4d_4147_5041_4745;
