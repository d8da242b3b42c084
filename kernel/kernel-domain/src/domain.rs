use crate::arena::PageArena;
use crate::free_queue::DomainFreeQueue;
use crate::stats::DomainStats;
use crate::zonelist::Zonelist;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_buddy::{BuddyZone, PhysAddr, Pfn, order_for_pages, pfn_to_phys, phys_to_pfn};
use kernel_cpumask::CpuId;
use kernel_sync::SpinLock;
use kernel_topology::NumaId;

/// Per-core arena capacity: 1 % of domain pages, floored and capped.
pub(crate) fn arena_capacity(domain_pages: u64) -> usize {
    usize::try_from((domain_pages * crate::ARENA_SCALE_PERMILLE / 1000).clamp(64, 4096))
        .unwrap_or(4096)
}

/// Per-domain free-queue capacity: 0.5 % of total pages, floored and capped.
pub(crate) fn free_queue_capacity(total_pages: u64) -> usize {
    usize::try_from((total_pages * crate::FREEQUEUE_SCALE_PERMILLE / 1000).clamp(64, 16384))
        .unwrap_or(16384)
}

/// One NUMA domain of the physical allocator: a buddy zone, the per-core
/// page arenas, the pending-free queue and the domain's view of its peers.
pub struct DomainBuddy {
    pub(crate) id: NumaId,
    pub(crate) zone: SpinLock<BuddyZone>,
    pub(crate) arenas: Vec<PageArena>,
    pub(crate) cores: Vec<CpuId>,
    pub(crate) free_queue: DomainFreeQueue,
    pub(crate) zonelist: Zonelist,
    pub(crate) pages_used: AtomicU64,
    pub(crate) total_pages: u64,
    pub(crate) stats: DomainStats,
    start: PhysAddr,
    end: PhysAddr,
}

impl DomainBuddy {
    pub(crate) fn new(id: NumaId, zone: BuddyZone, cores: Vec<CpuId>, fq_capacity: usize) -> Self {
        let total_pages = zone.total_page_count();
        let start = pfn_to_phys(zone.start_pfn());
        let end = pfn_to_phys(zone.end_pfn());
        let arena_cap = arena_capacity(total_pages);
        let arenas = cores.iter().map(|_| PageArena::new(arena_cap)).collect();

        Self {
            id,
            zone: SpinLock::new(zone),
            arenas,
            cores,
            free_queue: DomainFreeQueue::new(fq_capacity),
            zonelist: Zonelist { entries: Vec::new() },
            pages_used: AtomicU64::new(0),
            total_pages,
            stats: DomainStats::default(),
            start,
            end,
        }
    }

    #[must_use]
    pub const fn id(&self) -> NumaId {
        self.id
    }

    #[must_use]
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Pages not currently handed out. Pages cached in arenas or the free
    /// queue count as free: they are reachable, just not through the buddy.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.total_pages
            .saturating_sub(self.pages_used.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Index of `cpu`'s arena within this domain, if the CPU belongs here.
    #[must_use]
    pub fn arena_index_of(&self, cpu: CpuId) -> Option<usize> {
        self.cores.iter().position(|c| *c == cpu)
    }

    #[must_use]
    pub fn free_queue_len(&self) -> usize {
        self.free_queue.len()
    }

    #[must_use]
    pub fn arena_len(&self, idx: usize) -> usize {
        self.arenas[idx].len()
    }

    #[must_use]
    pub const fn stats(&self) -> &DomainStats {
        &self.stats
    }

    /// This domain's ordered view of its peers.
    #[must_use]
    pub const fn zonelist(&self) -> &Zonelist {
        &self.zonelist
    }

    pub(crate) fn account_alloc(&self, pages: u64) {
        let rounded = 1u64 << order_for_pages(pages);
        self.pages_used.fetch_add(rounded, Ordering::Relaxed);
    }

    pub(crate) fn account_free(&self, pages: u64) {
        let rounded = 1u64 << order_for_pages(pages);
        self.pages_used.fetch_sub(rounded, Ordering::Relaxed);
    }

    /// Allocates straight from this domain's buddy under its lock.
    pub(crate) fn alloc_from_buddy(&self, pages: u64) -> Option<PhysAddr> {
        let pfn = self.zone.with_lock(|z| z.alloc_pages(pages));
        match pfn {
            Some(pfn) => {
                self.account_alloc(pages);
                Some(pfn_to_phys(pfn))
            }
            None => {
                self.stats.record_failed();
                None
            }
        }
    }

    /// Merges pages straight back into the buddy.
    pub(crate) fn free_to_buddy(&self, addr: PhysAddr, pages: u64) {
        self.zone.with_lock(|z| z.free_pages(phys_to_pfn(addr), pages));
    }

    /// Pops one cached page from any arena of this domain.
    pub(crate) fn pop_any_arena(&self) -> Option<Pfn> {
        self.arenas.iter().find_map(PageArena::pop)
    }

    /// Pushes a single page onto any arena with room.
    pub(crate) fn push_any_arena(&self, pfn: Pfn) -> bool {
        self.arenas.iter().any(|a| a.push(pfn))
    }
}
