use crate::memmap::MemoryMap;
use crate::{MAX_ORDER, ORDER_COUNT, PAGE_SIZE, Pfn, pages_for};
use alloc::vec;
use alloc::vec::Vec;

/// Sentinel for "no next page" in the free-list links.
const NO_PAGE: u32 = u32::MAX;

const FLAG_FREE: u8 = 1 << 0;
const FLAG_USABLE: u8 = 1 << 1;
const FLAG_PINNED: u8 = 1 << 2;

/// Descriptor of one physical page.
///
/// Descriptors live in one contiguous array indexed by the PFN offset into
/// the zone; the free lists are threaded through `next`.
#[derive(Clone, Copy, Debug)]
struct PageDesc {
    next: u32,
    order: u8,
    flags: u8,
}

impl PageDesc {
    const fn is_free(self) -> bool {
        self.flags & FLAG_FREE != 0
    }

    const fn is_usable(self) -> bool {
        self.flags & FLAG_USABLE != 0
    }

    const fn is_pinned(self) -> bool {
        self.flags & FLAG_PINNED != 0
    }
}

/// One free list head per order.
#[derive(Clone, Copy, Debug, Default)]
struct FreeArea {
    head: u32,
    nr_free: usize,
}

/// A buddy allocator over one contiguous PFN range.
pub struct BuddyZone {
    domain: usize,
    start_pfn: Pfn,
    pages: Vec<PageDesc>,
    areas: [FreeArea; ORDER_COUNT],
    free_pages: u64,
    total_usable: u64,
}

impl BuddyZone {
    /// Builds a zone for `[start_pfn, end_pfn)` from the firmware map.
    ///
    /// The first allocation the zone ever makes is for its own descriptor
    /// array: the backing pages are carved out of the largest usable run and
    /// pinned before any range is registered, so they can never be handed
    /// out or merged.
    #[must_use]
    pub fn from_memmap(domain: usize, start_pfn: Pfn, end_pfn: Pfn, map: &MemoryMap) -> Self {
        assert!(end_pfn > start_pfn);
        let len = usize::try_from(end_pfn - start_pfn).expect("zone too large");
        let mut zone = Self {
            domain,
            start_pfn,
            pages: vec![
                PageDesc {
                    next: NO_PAGE,
                    order: 0,
                    flags: 0,
                };
                len
            ],
            areas: [FreeArea {
                head: NO_PAGE,
                nr_free: 0,
            }; ORDER_COUNT],
            free_pages: 0,
            total_usable: 0,
        };

        zone.mark_usable(map);
        zone.pin_descriptor_pages(map);

        for region in map.usable() {
            let (base, end) = region.page_aligned();
            if base >= end {
                continue;
            }
            zone.add_range(base / PAGE_SIZE, end / PAGE_SIZE);
        }

        log::debug!(
            "buddy: domain {domain} zone {start_pfn:#x}..{end_pfn:#x}, {} usable pages",
            zone.total_usable
        );
        zone
    }

    /// A fully-free zone of `page_count` pages. Test and bring-up helper.
    #[must_use]
    pub fn with_free_range(domain: usize, start_pfn: Pfn, page_count: u64) -> Self {
        let len = usize::try_from(page_count).expect("zone too large");
        let mut zone = Self {
            domain,
            start_pfn,
            pages: vec![
                PageDesc {
                    next: NO_PAGE,
                    order: 0,
                    flags: FLAG_USABLE,
                };
                len
            ],
            areas: [FreeArea {
                head: NO_PAGE,
                nr_free: 0,
            }; ORDER_COUNT],
            free_pages: 0,
            total_usable: page_count,
        };
        zone.add_range(start_pfn, start_pfn + page_count);
        zone
    }

    fn mark_usable(&mut self, map: &MemoryMap) {
        for region in map.usable() {
            let (base, end) = region.page_aligned();
            let mut pfn = base / PAGE_SIZE;
            while pfn < end / PAGE_SIZE {
                if let Some(idx) = self.index_of(pfn) {
                    self.pages[idx].flags |= FLAG_USABLE;
                    self.total_usable += 1;
                }
                pfn += 1;
            }
        }
    }

    /// Pins the pages that would back this zone's descriptor array, taken
    /// from the front of the largest usable run inside the zone.
    fn pin_descriptor_pages(&mut self, map: &MemoryMap) {
        let desc_bytes = (self.pages.len() * core::mem::size_of::<PageDesc>()) as u64;
        let mut needed = pages_for(desc_bytes);

        let largest = map
            .usable()
            .max_by_key(|r| r.length)
            .map(|r| r.page_aligned());
        let Some((base, end)) = largest else { return };

        let mut pfn = base / PAGE_SIZE;
        while needed > 0 && pfn < end / PAGE_SIZE {
            if let Some(idx) = self.index_of(pfn) {
                self.pages[idx].flags |= FLAG_PINNED;
                self.total_usable -= 1;
                needed -= 1;
            }
            pfn += 1;
        }
    }

    /// Registers `[from, to)` by carving the largest aligned blocks.
    fn add_range(&mut self, from: Pfn, to: Pfn) {
        let mut pfn = from.max(self.start_pfn);
        let to = to.min(self.start_pfn + self.pages.len() as u64);

        while pfn < to {
            let remaining = to - pfn;
            let mut order = remaining.ilog2().min(u32::from(MAX_ORDER)) as u8;

            // Shrink until the block is aligned on its own size.
            while order > 0 && (pfn - self.start_pfn) & ((1 << order) - 1) != 0 {
                order -= 1;
            }
            while (1u64 << order) > remaining {
                order -= 1;
            }

            if self.block_insertable(pfn, order) {
                self.push_free(pfn, order);
                self.free_pages += 1 << order;
            } else if order > 0 {
                // A pinned or unusable page sits inside; descend.
                let half = order - 1;
                self.add_range(pfn, pfn + (1 << half));
                self.add_range(pfn + (1 << half), pfn + (1 << order));
            }

            pfn += 1 << order;
        }
    }

    fn block_insertable(&self, pfn: Pfn, order: u8) -> bool {
        (0..1u64 << order).all(|i| {
            self.index_of(pfn + i)
                .is_some_and(|idx| self.pages[idx].is_usable() && !self.pages[idx].is_pinned())
        })
    }

    #[inline]
    fn index_of(&self, pfn: Pfn) -> Option<usize> {
        if pfn < self.start_pfn {
            return None;
        }
        let idx = usize::try_from(pfn - self.start_pfn).ok()?;
        (idx < self.pages.len()).then_some(idx)
    }

    fn push_free(&mut self, pfn: Pfn, order: u8) {
        let idx = self.index_of(pfn).expect("pfn outside zone");
        let area = &mut self.areas[order as usize];
        self.pages[idx].order = order;
        self.pages[idx].flags |= FLAG_FREE;
        self.pages[idx].next = area.head;
        area.head = idx as u32;
        area.nr_free += 1;
    }

    fn pop_free(&mut self, order: u8) -> Option<usize> {
        let area = &mut self.areas[order as usize];
        if area.head == NO_PAGE {
            debug_assert_eq!(area.nr_free, 0);
            return None;
        }
        let idx = area.head as usize;
        area.head = self.pages[idx].next;
        area.nr_free -= 1;
        self.pages[idx].next = NO_PAGE;
        self.pages[idx].flags &= !FLAG_FREE;
        Some(idx)
    }

    /// Unlinks a specific free block from its order list.
    fn unlink_free(&mut self, idx: usize, order: u8) {
        let area = &mut self.areas[order as usize];
        let target = idx as u32;

        if area.head == target {
            area.head = self.pages[idx].next;
        } else {
            let mut cursor = area.head;
            loop {
                assert_ne!(cursor, NO_PAGE, "free list corruption: block not on list");
                let next = self.pages[cursor as usize].next;
                if next == target {
                    self.pages[cursor as usize].next = self.pages[idx].next;
                    break;
                }
                cursor = next;
            }
        }

        area.nr_free -= 1;
        self.pages[idx].next = NO_PAGE;
        self.pages[idx].flags &= !FLAG_FREE;
    }

    /// Allocates a block of `order`, splitting larger blocks as needed.
    ///
    /// Returns `None` when no order can satisfy the request; the caller
    /// decides whether that is fatal.
    pub fn alloc_order(&mut self, order: u8) -> Option<Pfn> {
        assert!(order <= MAX_ORDER);

        let found = (order..=MAX_ORDER).find(|o| self.areas[*o as usize].nr_free > 0)?;
        let idx = self.pop_free(found)?;

        // Give back the right halves until we reach the requested order.
        for split in (order..found).rev() {
            let buddy_pfn = self.start_pfn + idx as u64 + (1 << split);
            self.push_free(buddy_pfn, split);
        }

        self.pages[idx].order = order;
        self.free_pages -= 1 << order;
        Some(self.start_pfn + idx as u64)
    }

    /// Frees a block of `order` at `pfn`, merging with free buddies.
    ///
    /// # Panics
    /// Panics on a double free or a PFN outside the zone — both indicate a
    /// bug, not a recoverable fault.
    pub fn free_order(&mut self, pfn: Pfn, order: u8) {
        let mut idx = self.index_of(pfn).expect("free of pfn outside zone");
        assert!(
            !self.pages[idx].is_free(),
            "double free of pfn {pfn:#x} (order {order})"
        );

        let freed_pages = 1u64 << order;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy_idx = idx ^ (1 << order);
            let mergeable = buddy_idx < self.pages.len() && {
                let buddy = self.pages[buddy_idx];
                buddy.is_free() && buddy.order == order && !buddy.is_pinned()
            };
            if !mergeable {
                break;
            }

            self.unlink_free(buddy_idx, order);
            idx = idx.min(buddy_idx);
            order += 1;
        }

        let merged_pfn = self.start_pfn + idx as u64;
        self.push_free(merged_pfn, order);
        self.free_pages += freed_pages;
    }

    /// Allocates at least `page_count` contiguous pages.
    pub fn alloc_pages(&mut self, page_count: u64) -> Option<Pfn> {
        self.alloc_order(crate::order_for_pages(page_count))
    }

    /// Frees an allocation made by [`alloc_pages`](Self::alloc_pages) with
    /// the same `page_count`.
    pub fn free_pages(&mut self, pfn: Pfn, page_count: u64) {
        self.free_order(pfn, crate::order_for_pages(page_count));
    }

    #[must_use]
    pub const fn domain(&self) -> usize {
        self.domain
    }

    #[must_use]
    pub const fn start_pfn(&self) -> Pfn {
        self.start_pfn
    }

    #[must_use]
    pub fn end_pfn(&self) -> Pfn {
        self.start_pfn + self.pages.len() as u64
    }

    #[must_use]
    pub fn contains(&self, pfn: Pfn) -> bool {
        self.index_of(pfn).is_some()
    }

    /// Pages currently sitting in the free areas.
    #[must_use]
    pub const fn free_page_count(&self) -> u64 {
        self.free_pages
    }

    /// Usable pages managed by this zone.
    #[must_use]
    pub const fn total_page_count(&self) -> u64 {
        self.total_usable
    }

    /// Number of free blocks at `order`.
    #[must_use]
    pub fn free_blocks_at(&self, order: u8) -> usize {
        self.areas[order as usize].nr_free
    }

    /// Validates that every free-list count matches its list length.
    #[must_use]
    pub fn check_free_areas(&self) -> bool {
        for (order, area) in self.areas.iter().enumerate() {
            let mut n = 0;
            let mut cursor = area.head;
            while cursor != NO_PAGE {
                let page = self.pages[cursor as usize];
                if !page.is_free() || page.order as usize != order {
                    return false;
                }
                n += 1;
                cursor = page.next;
            }
            if n != area.nr_free {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRegion;

    #[test]
    fn alloc_free_roundtrip() {
        let mut z = BuddyZone::with_free_range(0, 0, 64);
        assert_eq!(z.free_page_count(), 64);

        let a = z.alloc_order(0).unwrap();
        let b = z.alloc_order(2).unwrap();
        assert_ne!(a, b);
        assert_eq!(z.free_page_count(), 64 - 1 - 4);

        z.free_order(a, 0);
        z.free_order(b, 2);
        assert_eq!(z.free_page_count(), 64);
        assert!(z.check_free_areas());
        // Fully merged back to a single order-6 block.
        assert_eq!(z.free_blocks_at(6), 1);
    }

    #[test]
    fn split_produces_buddies() {
        let mut z = BuddyZone::with_free_range(0, 0, 8);
        let p = z.alloc_order(0).unwrap();
        // 8 = 1 + 1 + 2 + 4 after splitting down to order 0.
        assert_eq!(z.free_blocks_at(0), 1);
        assert_eq!(z.free_blocks_at(1), 1);
        assert_eq!(z.free_blocks_at(2), 1);
        z.free_order(p, 0);
        assert_eq!(z.free_blocks_at(3), 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut z = BuddyZone::with_free_range(0, 0, 4);
        let p = z.alloc_order(0).unwrap();
        z.free_order(p, 0);
        z.free_order(p, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut z = BuddyZone::with_free_range(0, 0, 2);
        assert!(z.alloc_order(1).is_some());
        assert!(z.alloc_order(0).is_none());
    }

    #[test]
    fn memmap_init_skips_reserved_and_pins_descriptors() {
        let map = MemoryMap::new(vec![
            MemoryRegion::usable(0, 64 * PAGE_SIZE),
            MemoryRegion::reserved(64 * PAGE_SIZE, 64 * PAGE_SIZE),
            MemoryRegion::usable(128 * PAGE_SIZE, 128 * PAGE_SIZE),
        ]);
        let z = BuddyZone::from_memmap(0, 0, 256, &map);

        // Descriptor pages are pinned inside the largest run, so the free
        // count is total usable pages.
        assert_eq!(z.free_page_count(), z.total_page_count());
        assert!(z.total_page_count() < 192);
        assert!(z.check_free_areas());
    }

    #[test]
    fn conservation_over_random_pattern() {
        let mut z = BuddyZone::with_free_range(0, 0, 256);
        let initial = z.free_page_count();

        let mut held = alloc::vec::Vec::new();
        // Deterministic interleaving of allocs and frees.
        for i in 0..200u64 {
            if i % 3 == 0 && !held.is_empty() {
                let (pfn, order) = held.swap_remove((i as usize * 7) % held.len());
                z.free_order(pfn, order);
            } else {
                let order = (i % 3) as u8;
                if let Some(pfn) = z.alloc_order(order) {
                    held.push((pfn, order));
                }
            }
        }
        let outstanding: u64 = held.iter().map(|(_, o)| 1u64 << o).sum();
        assert_eq!(z.free_page_count() + outstanding, initial);

        for (pfn, order) in held {
            z.free_order(pfn, order);
        }
        assert_eq!(z.free_page_count(), initial);
        assert!(z.check_free_areas());
    }
}
