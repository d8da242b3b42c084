use crate::domain::{DomainBuddy, free_queue_capacity};
use crate::flags::{AllocFlags, LOCALITY_MAX, LOCALITY_MIN};
use crate::zonelist::Zonelist;
use crate::{DISTANCE_WEIGHT, FREE_PAGES_WEIGHT};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_buddy::{BuddyZone, PhysAddr, phys_to_pfn};
use kernel_cpumask::CpuId;
use kernel_sync::SpinLock;
use kernel_topology::{NumaId, Topology};

/// Receives a nudge when a domain has accumulated enough pending frees for
/// its flush worker to run. The kernel wires this to a semaphore the
/// domain-local flush thread waits on.
pub trait FlushNotify: Send + Sync {
    fn notify(&self, domain: NumaId);
}

/// How many frees accumulate on a domain before its flush worker is nudged.
const FLUSH_BATCH: u64 = 32;

/// Remote-domain ops delta above which the domain counts as busy.
const BUSY_OPS_DELTA: u64 = 32;

/// The NUMA-aware physical page allocator: every domain's buddy, arenas and
/// free queue, plus the per-CPU interleave cursors.
pub struct DomainSet {
    topology: Arc<Topology>,
    domains: Vec<DomainBuddy>,
    /// Round-robin interleave cursor, one per CPU.
    rr_cursor: Vec<AtomicUsize>,
    /// Frees on each domain since its flush worker last ran.
    frees_since_flush: Vec<AtomicU64>,
    /// Ops snapshot per domain for the busyness probe.
    ops_snapshot: Vec<AtomicU64>,
    flush_notify: SpinLock<Option<Arc<dyn FlushNotify>>>,
}

impl DomainSet {
    /// Builds the domain allocator from per-domain buddy zones.
    ///
    /// `zones[d]` must cover the PFN range owned by NUMA node `d`.
    ///
    /// # Panics
    /// Panics if the zone count does not match the topology's NUMA count.
    #[must_use]
    pub fn new(topology: Arc<Topology>, zones: Vec<BuddyZone>) -> Self {
        assert_eq!(zones.len(), topology.numa_count(), "one zone per domain");

        let total_pages: u64 = zones.iter().map(BuddyZone::total_page_count).sum();
        let fq_cap = free_queue_capacity(total_pages);

        let mut domains: Vec<DomainBuddy> = zones
            .into_iter()
            .enumerate()
            .map(|(id, zone)| {
                let cores: Vec<CpuId> = topology.numa_cpus(id).iter().collect();
                DomainBuddy::new(id, zone, cores, fq_cap)
            })
            .collect();

        let free_pages: Vec<u64> = domains.iter().map(DomainBuddy::free_pages).collect();
        for d in &mut domains {
            d.zonelist = Zonelist::build(&topology, d.id, &free_pages);
        }

        let cpus = topology.cpu_count();
        let numa = domains.len();
        Self {
            topology,
            domains,
            rr_cursor: (0..cpus).map(|_| AtomicUsize::new(0)).collect(),
            frees_since_flush: (0..numa).map(|_| AtomicU64::new(0)).collect(),
            ops_snapshot: (0..numa).map(|_| AtomicU64::new(0)).collect(),
            flush_notify: SpinLock::new(None),
        }
    }

    /// Installs the flush-worker notifier; done once during boot wiring.
    pub fn set_flush_notify(&self, notify: Arc<dyn FlushNotify>) {
        *self.flush_notify.lock() = Some(notify);
    }

    #[must_use]
    pub fn domain(&self, id: NumaId) -> &DomainBuddy {
        &self.domains[id]
    }

    #[must_use]
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn domain_of_cpu(&self, cpu: CpuId) -> &DomainBuddy {
        &self.domains[self.topology.numa_of(cpu)]
    }

    /// The domain owning a physical address.
    ///
    /// # Panics
    /// Panics when no domain covers `addr` — a free of a foreign address is
    /// a bug, not a runtime fault.
    #[must_use]
    pub fn domain_for_addr(&self, addr: PhysAddr) -> &DomainBuddy {
        self.domains
            .iter()
            .find(|d| d.contains(addr))
            .unwrap_or_else(|| panic!("likely invalid free address {addr:#x}"))
    }

    #[must_use]
    pub const fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Total free pages across every domain.
    #[must_use]
    pub fn free_pages_total(&self) -> u64 {
        self.domains.iter().map(DomainBuddy::free_pages).sum()
    }

    // ---- allocation ------------------------------------------------------

    /// Allocates `pages` contiguous pages on behalf of `cpu`.
    ///
    /// Returns `None` when every permitted domain is exhausted; the slab
    /// layer may respond with an emergency GC pass and retry.
    pub fn alloc_pages(&self, cpu: CpuId, pages: u64, flags: AllocFlags) -> Option<PhysAddr> {
        assert!(pages > 0, "zero-page allocation");

        if flags.interleaved() {
            return self.alloc_interleaved(cpu, pages);
        }

        // Fastpath: arena pop, then a free-queue drain, then peer arenas.
        if let Some(addr) = self.try_alloc_from_arenas(cpu, pages) {
            return Some(addr);
        }

        let local = self.domain_of_cpu(cpu);
        let flexible = flags.flexible()
            || flags.locality == LOCALITY_MIN
            || self.topology.numa_count() == 1;

        if flags.locality == LOCALITY_MAX && !flexible {
            return local.alloc_from_buddy(pages);
        }

        self.alloc_with_locality(cpu, pages, flexible, flags.locality)
    }

    fn try_alloc_from_arenas(&self, cpu: CpuId, pages: u64) -> Option<PhysAddr> {
        if pages > 1 {
            return None; // arenas only cache single pages
        }

        let local = self.domain_of_cpu(cpu);
        let arena_idx = local.arena_index_of(cpu)?;

        if let Some(pfn) = local.arenas[arena_idx].pop() {
            local.account_alloc(1);
            local.stats.record_alloc(false, false);
            return Some(kernel_buddy::pfn_to_phys(pfn));
        }

        if let Some(addr) = self.try_alloc_from_free_queue(local, arena_idx) {
            return Some(addr);
        }

        // Peer arenas within the local domain.
        if let Some(pfn) = local.pop_any_arena() {
            local.account_alloc(1);
            local.stats.record_alloc(false, false);
            return Some(kernel_buddy::pfn_to_phys(pfn));
        }

        None
    }

    /// Drains a quota of the local free queue into the local arena, then
    /// retries the arena.
    fn try_alloc_from_free_queue(&self, local: &DomainBuddy, arena_idx: usize) -> Option<PhysAddr> {
        let fq = &local.free_queue;
        if fq.len() <= local.core_count() {
            return None;
        }

        let quota = (fq.len() / local.core_count()).max(1);
        for _ in 0..quota {
            let Some((addr, pages)) = fq.dequeue() else { break };
            if pages > 1 {
                local.free_to_buddy(addr, pages);
                continue;
            }
            if !local.arenas[arena_idx].push(phys_to_pfn(addr)) {
                local.free_to_buddy(addr, pages);
            }
        }

        local.arenas[arena_idx].pop().map(|pfn| {
            local.account_alloc(1);
            local.stats.record_alloc(false, false);
            kernel_buddy::pfn_to_phys(pfn)
        })
    }

    /// Allocates from a chosen domain: its arenas first for single pages,
    /// then its buddy. Stats are recorded against the requesting CPU's
    /// domain, where remote traffic is observed.
    fn alloc_from_domain(
        &self,
        local: &DomainBuddy,
        target: &DomainBuddy,
        pages: u64,
    ) -> Option<PhysAddr> {
        let remote = local.id != target.id;
        if pages == 1
            && let Some(pfn) = target.pop_any_arena()
        {
            target.account_alloc(1);
            local.stats.record_alloc(remote, false);
            return Some(kernel_buddy::pfn_to_phys(pfn));
        }

        let addr = target.alloc_from_buddy(pages)?;
        local.stats.record_alloc(remote, false);
        Some(addr)
    }

    fn alloc_interleaved(&self, cpu: CpuId, pages: u64) -> Option<PhysAddr> {
        let local = self.domain_of_cpu(cpu);
        let zl = &local.zonelist;
        let idx = self.rr_cursor[cpu].fetch_add(1, Ordering::Relaxed) % zl.len();
        let entry = zl.entries[idx];
        let target = &self.domains[entry.domain];

        let ret = if target.free_pages() >= pages {
            // Multi-page interleaved requests go straight to the buddy.
            if pages > 1 {
                target.alloc_from_buddy(pages)
            } else {
                self.alloc_from_domain(local, target, pages)
            }
        } else {
            None
        };

        if ret.is_some() {
            local.stats.record_alloc(false, true);
        } else {
            local.stats.record_failed();
        }
        ret
    }

    fn alloc_with_locality(
        &self,
        cpu: CpuId,
        pages: u64,
        flexible: bool,
        locality: u8,
    ) -> Option<PhysAddr> {
        let local = self.domain_of_cpu(cpu);
        let zl = &local.zonelist;

        let mut max_scan =
            (usize::from(locality) + 1) * zl.len() / usize::from(LOCALITY_MAX);
        max_scan = max_scan.clamp(1, zl.len());
        if flexible {
            max_scan = zl.len();
        }

        let dist_weight = if flexible {
            DISTANCE_WEIGHT / 4
        } else {
            DISTANCE_WEIGHT
        };

        let mut best: Option<(&crate::zonelist::ZonelistEntry, i64)> = None;
        for entry in &zl.entries[..max_scan] {
            let candidate = &self.domains[entry.domain];
            let free = candidate.free_pages();
            if free < pages {
                continue;
            }

            let score = i64::from(entry.distance) * dist_weight
                - i64::try_from(free).unwrap_or(i64::MAX) * FREE_PAGES_WEIGHT;
            if best.is_none_or(|(_, s)| score < s) {
                best = Some((entry, score));
            }
        }

        let (best_entry, _) = best?;
        let best_dom = &self.domains[best_entry.domain];
        if let Some(addr) = self.alloc_from_domain(local, best_dom, pages) {
            return Some(addr);
        }

        if flexible {
            for entry in &zl.entries[..max_scan] {
                if entry.domain == best_entry.domain {
                    continue;
                }
                let candidate = &self.domains[entry.domain];
                if let Some(addr) = self.alloc_from_domain(local, candidate, pages) {
                    return Some(addr);
                }
            }
        }

        local.stats.record_failed();
        None
    }

    /// Allocates from one specific domain, arenas first. Used by the slab
    /// layer once its cache search has already chosen a domain.
    pub fn alloc_pages_on_domain(
        &self,
        cpu: CpuId,
        domain: NumaId,
        pages: u64,
    ) -> Option<PhysAddr> {
        let local = self.domain_of_cpu(cpu);
        self.alloc_from_domain(local, &self.domains[domain], pages)
    }

    // ---- freeing ---------------------------------------------------------

    /// Returns `pages` at `addr` on behalf of `cpu`.
    pub fn free_pages(&self, cpu: CpuId, addr: PhysAddr, pages: u64) {
        let target = self.domain_for_addr(addr);
        let local = self.domain_of_cpu(cpu);

        target.account_free(pages);
        target.stats.record_free();

        if target.id == local.id {
            self.free_local(local, cpu, addr, pages);
        } else {
            self.free_remote(target, addr, pages);
        }

        self.note_free(local.id);
        self.flush_free_queue(local.id);
    }

    fn free_local(&self, local: &DomainBuddy, cpu: CpuId, addr: PhysAddr, pages: u64) {
        if pages > 1 {
            return local.free_to_buddy(addr, pages);
        }

        let pfn = phys_to_pfn(addr);
        if let Some(idx) = local.arena_index_of(cpu)
            && local.arenas[idx].push(pfn)
        {
            return;
        }
        if local.push_any_arena(pfn) {
            return;
        }
        local.free_to_buddy(addr, pages);
    }

    /// A remote free prefers the owner's free queue. When the ring is full,
    /// multi-page frees merge directly; single pages go to the owner's
    /// arenas only when the owner looks busy, otherwise straight to its
    /// buddy so an idle domain is not left holding stale cache.
    fn free_remote(&self, target: &DomainBuddy, addr: PhysAddr, pages: u64) {
        if target.free_queue.enqueue(addr, pages) {
            return;
        }

        if pages > 1 {
            return target.free_to_buddy(addr, pages);
        }

        if self.domain_is_busy(target.id) && target.push_any_arena(phys_to_pfn(addr)) {
            return;
        }
        target.free_to_buddy(addr, pages);
    }

    fn domain_is_busy(&self, id: NumaId) -> bool {
        let now = self.domains[id].stats.ops();
        let snap = self.ops_snapshot[id].load(Ordering::Relaxed);
        now.saturating_sub(snap) > BUSY_OPS_DELTA
    }

    fn note_free(&self, local: NumaId) {
        let n = self.frees_since_flush[local].fetch_add(1, Ordering::Relaxed) + 1;
        if n >= FLUSH_BATCH {
            self.frees_since_flush[local].store(0, Ordering::Relaxed);
            if let Some(notify) = self.flush_notify.with_lock(|n| n.clone()) {
                notify.notify(local);
            }
        }
    }

    /// Moves queued frees of `domain` into its arenas (or buddy), bounded by
    /// half the queue or the arena headroom. Called by the flush worker and
    /// opportunistically after frees; concurrent passes collapse into one.
    pub fn flush_free_queue(&self, domain: NumaId) {
        let d = &self.domains[domain];
        if !d.free_queue.begin_drain() {
            return;
        }

        let slots_available: usize = d.arenas.iter().map(crate::arena::PageArena::available).sum();
        let target = (d.free_queue.len() / 2).min(slots_available).max(1);

        for _ in 0..target {
            let Some((addr, pages)) = d.free_queue.dequeue() else {
                break;
            };
            if pages > 1 {
                d.free_to_buddy(addr, pages);
                continue;
            }
            if !d.push_any_arena(phys_to_pfn(addr)) {
                d.free_to_buddy(addr, pages);
            }
        }

        // Refresh the busyness snapshot while we are here.
        self.ops_snapshot[domain].store(d.stats.ops(), Ordering::Relaxed);
        d.free_queue.end_drain();
        log::trace!("domain {domain}: flushed free queue, {} pending", d.free_queue.len());
    }

    /// Drains a domain's free queue completely. Test and shutdown helper.
    pub fn drain_free_queue_fully(&self, domain: NumaId) {
        let d = &self.domains[domain];
        while let Some((addr, pages)) = d.free_queue.dequeue() {
            if pages > 1 || !d.push_any_arena(phys_to_pfn(addr)) {
                d.free_to_buddy(addr, pages);
            }
        }
    }
}
