//! # Binary buddy page allocator
//!
//! A power-of-two allocator over a physical page-frame range, with orders
//! 0 through [`MAX_ORDER`]. Each order keeps a singly-linked free list of
//! head pages threaded through the page descriptor array; allocation splits
//! the smallest satisfying block and freeing merges with the buddy as long
//! as it is free and of equal order.
//!
//! A [`BuddyZone`] covers one contiguous PFN range and is instantiated per
//! NUMA domain; on machines without NUMA there is a single zone. Zone
//! initialization scans a firmware-style [`MemoryMap`], carving the largest
//! aligned blocks out of every usable range, after pinning the pages that
//! back the descriptor array itself.
//!
//! The zone never panics on exhaustion: allocation returns `None` and the
//! caller decides policy.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod memmap;
mod zone;

pub use memmap::{MemoryMap, MemoryRegion, RegionKind};
pub use zone::BuddyZone;

/// Size of the canonical page in bytes.
pub const PAGE_SIZE: u64 = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// Highest buddy order; a block of this order spans 2^22 pages.
pub const MAX_ORDER: u8 = 22;
/// Number of distinct orders (0..=[`MAX_ORDER`]).
pub const ORDER_COUNT: usize = MAX_ORDER as usize + 1;

/// Physical page frame number.
pub type Pfn = u64;
/// Physical byte address.
pub type PhysAddr = u64;

/// Converts a PFN to the physical address of its first byte.
#[must_use]
pub const fn pfn_to_phys(pfn: Pfn) -> PhysAddr {
    pfn << PAGE_SHIFT
}

/// Converts a physical address to the PFN containing it.
#[must_use]
pub const fn phys_to_pfn(addr: PhysAddr) -> Pfn {
    addr >> PAGE_SHIFT
}

/// Number of pages needed to hold `bytes`.
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Smallest order whose block holds at least `pages` pages.
///
/// # Panics
/// Panics if `pages` is zero or exceeds the largest block.
#[must_use]
pub fn order_for_pages(pages: u64) -> u8 {
    assert!(pages > 0, "zero-page request");
    let order = 64 - u64::leading_zeros(pages.next_power_of_two()) - 1;
    assert!(order <= u32::from(MAX_ORDER), "request beyond max order");
    order as u8
}
