use crate::cache::DomainSlabs;
use crate::class::size_to_class;
use crate::free_queue::SlabFreeQueue;
use crate::gc::{GcAggressiveness, GcFlags, GcOutcome, GcRequest, gc_plan};
use crate::magazine::PerCpuMags;
use crate::meta::{SlabMeta, SlabState};
use crate::stats::SlabStats;
use crate::{
    KMALLOC_PAGE_MAGIC, PAGE_BYTES, SLAB_CLASS_COUNT, SLAB_FREE_QUEUE_ALLOC_PCT, SLAB_MAG_ENTRIES,
    SLAB_MAG_WATERMARK,
};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_buddy::{PhysAddr, pages_for};
use kernel_cpumask::CpuId;
use kernel_domain::{AllocBehavior, AllocFlags, DomainSet, LOCALITY_MAX};
use kernel_sync::SpinLock;
use kernel_time::ClockRef;
use kernel_vas::{HeapStore, VasArena, VirtAddr};
use kernel_topology::NumaId;

/// Bytes reserved ahead of a multi-page allocation for its header.
const LARGE_HDR_BYTES: u64 = 64;

/// Ops delta above which a remote domain counts as busy for free routing.
const BUSY_OPS_DELTA: u64 = 32;

/// Entries in each domain's object free-queue ring.
const FREE_QUEUE_SLOTS: usize = 1024;

/// Cache-search distance weight; quartered under flexible locality.
const CACHE_DISTANCE_WEIGHT: i64 = 16;

/// Boot parameters of the slab heap.
#[derive(Clone, Copy, Debug)]
pub struct SlabConfig {
    pub heap_base: VirtAddr,
    pub heap_len: u64,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            heap_base: 0xF000_0000,
            heap_len: 32 * 1024 * 1024,
        }
    }
}

struct PageBacking {
    phys: PhysAddr,
    pages: u64,
}

struct SlabDomain {
    inner: SpinLock<DomainSlabs>,
    free_queue: SlabFreeQueue,
    stats: SlabStats,
    ops_snapshot: AtomicU64,
}

/// The slab allocator front end: per-domain caches and GC, per-CPU
/// magazines, the shared heap arena and the virt→phys backing map.
pub struct SlabAllocator {
    domains: Vec<SlabDomain>,
    percpu: Vec<PerCpuMags>,
    /// Slab page → owning domain.
    owner: SpinLock<BTreeMap<VirtAddr, NumaId>>,
    /// Mapped page base → physical backing (slab pages and large allocs).
    page_map: SpinLock<BTreeMap<VirtAddr, PageBacking>>,
    vas: SpinLock<VasArena>,
    store: Arc<HeapStore>,
    domain_set: Arc<DomainSet>,
    clock: ClockRef,
}

impl SlabAllocator {
    #[must_use]
    pub fn new(domain_set: Arc<DomainSet>, clock: ClockRef, config: &SlabConfig) -> Self {
        let store = Arc::new(HeapStore::new(config.heap_base, config.heap_len));
        let domains = (0..domain_set.domain_count())
            .map(|_| SlabDomain {
                inner: SpinLock::new(DomainSlabs::default()),
                free_queue: SlabFreeQueue::new(FREE_QUEUE_SLOTS, Arc::clone(&store)),
                stats: SlabStats::default(),
                ops_snapshot: AtomicU64::new(0),
            })
            .collect();
        let cpus = domain_set.topology().cpu_count();

        Self {
            domains,
            percpu: (0..cpus).map(|_| PerCpuMags::default()).collect(),
            owner: SpinLock::new(BTreeMap::new()),
            page_map: SpinLock::new(BTreeMap::new()),
            vas: SpinLock::new(VasArena::new(
                config.heap_base,
                config.heap_base + config.heap_len,
            )),
            store,
            domain_set,
            clock,
        }
    }

    fn local_domain_id(&self, cpu: CpuId) -> NumaId {
        self.domain_set.topology().numa_of(cpu)
    }

    #[must_use]
    pub fn stats_of(&self, domain: NumaId) -> &SlabStats {
        &self.domains[domain].stats
    }

    #[must_use]
    pub fn free_queue_ring_len(&self, domain: NumaId) -> u64 {
        self.domains[domain].free_queue.ring_len()
    }

    #[must_use]
    pub fn gc_list_len(&self, domain: NumaId) -> usize {
        self.domains[domain].inner.with_lock(|s| s.gc_len())
    }

    #[must_use]
    pub fn magazine_len(&self, cpu: CpuId, class: usize) -> usize {
        self.percpu[cpu].mags[class].len()
    }

    /// Runs the domain-coherence check over every slab.
    #[must_use]
    pub fn check_all(&self) -> bool {
        self.domains.iter().all(|d| {
            d.inner
                .with_lock(|s| s.slabs.values().all(SlabMeta::check))
        })
    }

    // ---- page plumbing ---------------------------------------------------

    fn map_new_page(&self, cpu: CpuId, domain: NumaId) -> Option<VirtAddr> {
        let phys = self.domain_set.alloc_pages_on_domain(cpu, domain, 1)?;
        let virt = match self.vas.with_lock(|v| v.alloc(PAGE_BYTES, PAGE_BYTES)) {
            Ok(v) => v,
            Err(_) => {
                self.domain_set.free_pages(cpu, phys, 1);
                return None;
            }
        };
        self.page_map
            .with_lock(|m| m.insert(virt, PageBacking { phys, pages: 1 }));
        self.store.zero(virt, PAGE_BYTES);
        Some(virt)
    }

    fn unmap_pages(&self, cpu: CpuId, base: VirtAddr) {
        let backing = self
            .page_map
            .with_lock(|m| m.remove(&base))
            .expect("unmap of unmapped page");
        self.domain_set.free_pages(cpu, backing.phys, backing.pages);
        self.vas.with_lock(|v| v.free(base));
    }

    // ---- slab lifecycle --------------------------------------------------

    /// Finds or creates a slab with room and carves one object from it.
    fn cache_alloc(
        &self,
        cpu: CpuId,
        domain: NumaId,
        class: usize,
        pageable: bool,
        behavior: AllocBehavior,
        allow_new: bool,
    ) -> Option<VirtAddr> {
        let d = &self.domains[domain];

        loop {
            let got = d.inner.with_lock(|slabs| {
                let vpage = slabs.pick_usable(pageable, class)?;
                let meta = slabs.slabs.get_mut(&vpage).unwrap();
                let obj = meta.alloc_obj().expect("usable slab has room");
                let state = if meta.is_full() {
                    SlabState::Full
                } else {
                    SlabState::Partial
                };
                slabs.move_slab(vpage, state);
                Some(obj)
            });
            if got.is_some() {
                return got;
            }

            if !self.slab_create(cpu, domain, class, pageable, behavior, allow_new) {
                return None;
            }
        }
    }

    /// Provides a fresh free slab for a cache: the newest parked GC slab of
    /// the right pageability when faulting is allowed, else a new page.
    fn slab_create(
        &self,
        cpu: CpuId,
        domain: NumaId,
        class: usize,
        pageable: bool,
        behavior: AllocBehavior,
        allow_new: bool,
    ) -> bool {
        let d = &self.domains[domain];

        if behavior.may_fault() {
            let reused = d.inner.with_lock(|slabs| {
                let vpage = slabs.gc_take_newest(pageable)?;
                let meta = slabs.slabs.get_mut(&vpage).unwrap();
                meta.recycle_count += 1;
                meta.reinit(class, pageable);
                meta.state = SlabState::InGcList;
                slabs.move_slab(vpage, SlabState::Free);
                Some(vpage)
            });
            if reused.is_some() {
                SlabStats::bump(&d.stats.gc_reclaims);
                return true;
            }
        }

        if !allow_new {
            return false;
        }

        let Some(vpage) = self.map_new_page(cpu, domain) else {
            return false;
        };
        let phys = self.page_map.with_lock(|m| m[&vpage].phys);
        d.inner
            .with_lock(|slabs| slabs.insert_slab(SlabMeta::new(vpage, phys, class, domain, pageable)));
        self.owner.with_lock(|o| o.insert(vpage, domain));
        SlabStats::bump(&d.stats.new_slabs);
        true
    }

    /// Returns one object to its slab, handling list transitions and GC
    /// parking.
    fn slab_free_obj(&self, owner: NumaId, obj: VirtAddr) {
        let vpage = obj & !(PAGE_BYTES - 1);
        let d = &self.domains[owner];
        let now = self.clock.now_ms();

        d.inner.with_lock(|slabs| {
            let meta = slabs
                .slabs
                .get_mut(&vpage)
                .unwrap_or_else(|| panic!("free of address {obj:#x} with no owning slab"));
            let was_full = meta.state == SlabState::Full;
            meta.free_obj(obj);

            if meta.is_empty() {
                slabs.move_slab(vpage, SlabState::Free);
                // Keep one hot free slab per class; park the rest.
                let (pageable, class) = {
                    let m = &slabs.slabs[&vpage];
                    (m.pageable, m.class)
                };
                if slabs.lists(pageable, class).free.len() > 1 {
                    slabs.gc_enqueue(vpage, now);
                }
            } else if was_full {
                slabs.move_slab(vpage, SlabState::Partial);
            }

            debug_assert!(slabs.slabs[&vpage].check());
        });
    }

    fn slab_info(&self, owner: NumaId, vpage: VirtAddr) -> (usize, bool) {
        self.domains[owner].inner.with_lock(|slabs| {
            let meta = &slabs.slabs[&vpage];
            (meta.class, meta.pageable)
        })
    }

    // ---- cache search ----------------------------------------------------

    /// Scores the pageable and non-pageable caches across the zonelist and
    /// picks the cheapest with usable slabs; falls back to the local cache
    /// of the required pageability when everything is empty.
    fn search_for_cache(
        &self,
        cpu: CpuId,
        class: usize,
        flags: AllocFlags,
    ) -> (NumaId, bool) {
        let local = self.local_domain_id(cpu);
        let zl = self.domain_set.domain(local).zonelist();
        let pageable = flags.pageable();
        let flexible = flags.flexible();

        let numerator = usize::from(LOCALITY_MAX - flags.locality);
        let mut search = zl.len() * numerator / usize::from(LOCALITY_MAX);
        search = search.clamp(1, zl.len());

        let weight = if flexible {
            CACHE_DISTANCE_WEIGHT / 4
        } else {
            CACHE_DISTANCE_WEIGHT
        };

        let mut best: Option<(NumaId, bool, i64)> = None;
        for entry in &zl.entries[..search] {
            let d = &self.domains[entry.domain];
            let (np_usable, p_usable) = d.inner.with_lock(|slabs| {
                (
                    slabs.lists(false, class).usable(),
                    slabs.lists(true, class).usable(),
                )
            });

            let dist_part = i64::from(entry.distance) * weight;
            let np_score = if np_usable == 0 {
                i64::MAX
            } else {
                dist_part - np_usable as i64
            };
            let p_score = if p_usable == 0 {
                i64::MAX
            } else {
                dist_part - p_usable as i64
            };

            let consider = |best: &mut Option<(NumaId, bool, i64)>, dom, pg, score: i64| {
                if score != i64::MAX && best.is_none_or(|(_, _, s)| score < s) {
                    *best = Some((dom, pg, score));
                }
            };

            if pageable {
                // A clearly better-stocked non-pageable peer may serve a
                // pageable request.
                if np_score != i64::MAX && np_score <= p_score / 2 {
                    consider(&mut best, entry.domain, false, np_score);
                }
                consider(&mut best, entry.domain, true, p_score);
            } else {
                consider(&mut best, entry.domain, false, np_score);
            }
        }

        best.map_or((local, pageable), |(dom, pg, _)| (dom, pg))
    }

    // ---- magazines -------------------------------------------------------

    fn magazine_pop(&self, cpu: CpuId, class: usize, flags: AllocFlags) -> Option<VirtAddr> {
        let mag = &self.percpu[cpu].mags[class];
        // Reserve the low-water entries for non-pageable requests.
        if flags.pageable() && mag.len() < SLAB_MAG_WATERMARK {
            return None;
        }
        mag.pop()
    }

    /// Flushes one CPU magazine back to the owning caches.
    fn magazine_flush(&self, cpu: CpuId, class: usize) {
        let objs = self.percpu[cpu].mags[class].drain();
        for obj in objs {
            let vpage = obj & !(PAGE_BYTES - 1);
            let owner = self.owner.with_lock(|o| o[&vpage]);
            if !self.domains[owner].free_queue.ring_enqueue(obj) {
                self.slab_free_obj(owner, obj);
            } else {
                SlabStats::bump(&self.domains[owner].stats.frees_to_ring);
            }
        }
    }

    /// Flushes every magazine of `cpu`. Used when a CPU goes away and by
    /// drain cycles in tests.
    pub fn flush_cpu_magazines(&self, cpu: CpuId) {
        for class in 0..SLAB_CLASS_COUNT {
            self.magazine_flush(cpu, class);
        }
    }

    /// Tops the local magazines back up from existing local non-pageable
    /// slabs; never creates new slabs.
    fn percpu_refill(&self, cpu: CpuId, behavior: AllocBehavior) {
        let local = self.local_domain_id(cpu);
        for class in 0..SLAB_CLASS_COUNT {
            let mag = &self.percpu[cpu].mags[class];
            while mag.len() < SLAB_MAG_ENTRIES {
                let Some(obj) = self.cache_alloc(cpu, local, class, false, behavior, false) else {
                    break;
                };
                if !mag.push(obj) {
                    self.slab_free_obj(local, obj);
                    break;
                }
            }
        }
    }

    // ---- free queue ------------------------------------------------------

    fn domain_busy(&self, domain: NumaId) -> bool {
        let d = &self.domains[domain];
        d.stats
            .ops()
            .saturating_sub(d.ops_snapshot.load(Ordering::Relaxed))
            > BUSY_OPS_DELTA
    }

    /// Routes a free through the owner's free queue. Ring first; when the
    /// ring is full, a busy remote owner gets the overflow list (threaded
    /// through the freed object), an idle one gets a direct free.
    fn free_queue_enqueue(
        &self,
        cpu: CpuId,
        owner: NumaId,
        addr: VirtAddr,
        is_slab_obj: bool,
        behavior: AllocBehavior,
    ) -> bool {
        let local = self.local_domain_id(cpu);
        let d = &self.domains[owner];

        if d.free_queue.ring_enqueue(addr) {
            SlabStats::bump(&d.stats.frees_to_ring);
            return true;
        }

        if owner == local {
            return false;
        }

        if is_slab_obj && behavior.may_fault() && self.domain_busy(owner) {
            d.free_queue.list_enqueue(addr);
            SlabStats::bump(&d.stats.frees_to_list);
            return true;
        }

        false
    }

    /// Resolves one queued address back to its home: local magazines when
    /// requested, else the owning slab or the multi-page free path.
    fn resolve_freed(&self, cpu: CpuId, addr: VirtAddr, to_magazines: bool) {
        let vpage = addr & !(PAGE_BYTES - 1);
        if let Some(owner) = self.owner.with_lock(|o| o.get(&vpage).copied()) {
            let (class, pageable) = self.slab_info(owner, vpage);
            if to_magazines
                && !pageable
                && owner == self.local_domain_id(cpu)
                && self.percpu[cpu].mags[class].push(addr)
            {
                return;
            }
            self.slab_free_obj(owner, addr);
            return;
        }

        assert_eq!(
            self.store.read_u64(vpage),
            KMALLOC_PAGE_MAGIC,
            "free-queue entry {addr:#x} is neither slab object nor page run"
        );
        self.free_large_direct(cpu, vpage);
    }

    /// Drains a percentage of a domain's pending frees. Returns how many
    /// entries were processed.
    pub fn drain_free_queue(&self, cpu: CpuId, domain: NumaId, pct: u64) -> usize {
        let d = &self.domains[domain];
        let target = (d.free_queue.ring_len() * pct / 100).max(1);

        let mut drained = 0;
        for _ in 0..target {
            let Some(addr) = d.free_queue.dequeue() else {
                break;
            };
            self.resolve_freed(cpu, addr, true);
            drained += 1;
        }

        d.ops_snapshot.store(d.stats.ops(), Ordering::Relaxed);
        drained
    }

    /// Empties a domain's free queue, both tiers, straight into the caches.
    pub fn drain_free_queue_fully(&self, cpu: CpuId, domain: NumaId) -> usize {
        let mut drained = 0;
        while let Some(addr) = self.domains[domain].free_queue.dequeue() {
            self.resolve_freed(cpu, addr, false);
            drained += 1;
        }
        drained
    }

    // ---- large allocations ----------------------------------------------

    fn kmalloc_pages(
        &self,
        cpu: CpuId,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        let pages = pages_for(size + LARGE_HDR_BYTES);
        let base = self
            .vas
            .with_lock(|v| v.alloc(pages * PAGE_BYTES, PAGE_BYTES))
            .ok()?;

        let Some(phys) = self.domain_set.alloc_pages(cpu, pages, flags) else {
            self.vas.with_lock(|v| v.free(base));
            return None;
        };

        let domain = self.domain_set.domain_for_addr(phys).id();
        self.page_map
            .with_lock(|m| m.insert(base, PageBacking { phys, pages }));
        self.store.zero(base, pages * PAGE_BYTES);
        self.store.write_u64(base, KMALLOC_PAGE_MAGIC);
        self.store.write_u64(base + 8, pages);
        self.store.write_u64(base + 16, domain as u64);
        self.store
            .write_u64(base + 24, u64::from(flags.pageable()));

        SlabStats::bump(&self.domains[domain].stats.page_allocs);

        if behavior.may_fault() && !behavior.is_fast() {
            let local = self.local_domain_id(cpu);
            self.drain_free_queue(cpu, local, SLAB_FREE_QUEUE_ALLOC_PCT / 2);
        }

        Some(base + LARGE_HDR_BYTES)
    }

    fn free_large_direct(&self, cpu: CpuId, base: VirtAddr) {
        self.store.write_u64(base, 0); // clear the magic
        self.unmap_pages(cpu, base);
    }

    fn kfree_pages(&self, cpu: CpuId, base: VirtAddr, behavior: AllocBehavior) {
        let owner = usize::try_from(self.store.read_u64(base + 16)).unwrap_or(0);
        if self.free_queue_enqueue(cpu, owner, base + LARGE_HDR_BYTES, false, behavior) {
            return;
        }
        self.free_large_direct(cpu, base);
    }

    // ---- emergency GC ----------------------------------------------------

    /// Runs one GC pass over a domain and destroys what the plan retired.
    pub fn gc_run(&self, cpu: CpuId, domain: NumaId, req: &GcRequest) -> GcOutcome {
        let d = &self.domains[domain];
        let now = self.clock.now_ms();

        let (outcome, to_destroy) = d.inner.with_lock(|slabs| {
            let (outcome, to_destroy) = gc_plan(slabs, now, req);
            for vpage in &to_destroy {
                slabs.remove_slab(*vpage);
            }
            (outcome, to_destroy)
        });

        for vpage in to_destroy {
            self.owner.with_lock(|o| o.remove(&vpage));
            self.unmap_pages(cpu, vpage);
        }
        log::debug!(
            "slab gc: domain {domain} examined {} recycled {} destroyed {}",
            outcome.examined,
            outcome.recycled,
            outcome.destroyed
        );
        outcome
    }

    fn alloc_retry(
        &self,
        cpu: CpuId,
        domain: NumaId,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        let mut req = GcRequest {
            aggressiveness: GcAggressiveness::Emergency,
            ..GcRequest::default()
        };

        match size_to_class(size) {
            None => {
                req.flags |= GcFlags::FORCE_DESTROY;
                req.destroy_target = usize::try_from(pages_for(size)).unwrap_or(usize::MAX);
            }
            Some(class) => {
                req.order_bias = 1 << class;
            }
        }

        self.gc_run(cpu, domain, &req);

        match size_to_class(size) {
            None => self.kmalloc_pages(cpu, size, flags, behavior),
            Some(class) => {
                let pageable = flags.pageable();
                self.cache_alloc(cpu, domain, class, pageable, behavior, true)
            }
        }
    }

    // ---- public front end ------------------------------------------------

    /// Allocates `size` bytes. Returns `None` only when memory is truly
    /// exhausted after the emergency GC retry.
    pub fn kmalloc(
        &self,
        cpu: CpuId,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }
        if behavior == AllocBehavior::NoFault && flags.pageable() {
            panic!("pageable allocation with no-fault behavior");
        }

        let local = self.local_domain_id(cpu);
        SlabStats::bump(&self.domains[local].stats.alloc_calls);

        let Some(class) = size_to_class(size) else {
            let ret = self.kmalloc_pages(cpu, size, flags, behavior);
            if ret.is_none() {
                let retried =
                    (!behavior.is_fast()).then(|| self.alloc_retry(cpu, local, size, flags, behavior));
                let retried = retried.flatten();
                if retried.is_none() {
                    SlabStats::bump(&self.domains[local].stats.failures);
                }
                return retried;
            }
            return ret;
        };

        // Magazine fastpath.
        if let Some(obj) = self.magazine_pop(cpu, class, flags) {
            SlabStats::bump(&self.domains[local].stats.magazine_hits);
            return Some(obj);
        }

        // Miss: recycle pending frees toward the magazines, then retry.
        if behavior.may_fault() {
            let drained = self.drain_free_queue(cpu, local, 100);
            if drained > 0
                && let Some(obj) = self.magazine_pop(cpu, class, flags)
            {
                SlabStats::bump(&self.domains[local].stats.magazine_hits);
                return Some(obj);
            }
        }

        let (domain, pageable) = self.search_for_cache(cpu, class, flags);
        let mut ret = self.cache_alloc(cpu, domain, class, pageable, behavior, true);

        if ret.is_some() {
            let counter = if domain == local {
                &self.domains[local].stats.local_cache_hits
            } else {
                &self.domains[local].stats.remote_cache_hits
            };
            SlabStats::bump(counter);
        }

        // Slowpath housekeeping: top the magazines back up.
        self.percpu_refill(cpu, behavior);

        if ret.is_none() && !behavior.is_fast() {
            ret = self.alloc_retry(cpu, domain, size, flags, behavior);
        }
        if ret.is_none() {
            SlabStats::bump(&self.domains[local].stats.failures);
        }
        ret
    }

    /// Resizes an allocation, copying the usable prefix. Null grows from
    /// nothing; zero size frees.
    pub fn krealloc(
        &self,
        cpu: CpuId,
        ptr: VirtAddr,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        if ptr == 0 {
            return self.kmalloc(cpu, size, flags, behavior);
        }
        if size == 0 {
            self.kfree(cpu, ptr, behavior);
            return None;
        }

        let old = self.ksize(ptr);
        let new_ptr = self.kmalloc(cpu, size, flags, behavior)?;
        self.store.copy(ptr, new_ptr, old.min(size));
        self.kfree(cpu, ptr, behavior);
        Some(new_ptr)
    }

    /// Zeroed variant of [`kmalloc`](Self::kmalloc).
    pub fn kzalloc(
        &self,
        cpu: CpuId,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        let addr = self.kmalloc(cpu, size, flags, behavior)?;
        self.store.zero(addr, size);
        Some(addr)
    }

    /// Size usable behind `ptr`: the class size for slab objects, the page
    /// run minus header for large allocations.
    #[must_use]
    pub fn ksize(&self, ptr: VirtAddr) -> u64 {
        if ptr == 0 {
            return 0;
        }
        let vpage = ptr & !(PAGE_BYTES - 1);
        if let Some(owner) = self.owner.with_lock(|o| o.get(&vpage).copied()) {
            let (class, _) = self.slab_info(owner, vpage);
            return crate::class_size(class);
        }
        if self.store.read_u64(vpage) == KMALLOC_PAGE_MAGIC {
            let pages = self.store.read_u64(vpage + 8);
            return pages * PAGE_BYTES - LARGE_HDR_BYTES;
        }
        0
    }

    /// Frees `ptr`. Null is ignored; anything else must have come from
    /// [`kmalloc`](Self::kmalloc).
    ///
    /// # Panics
    /// Panics on foreign pointers and double frees.
    pub fn kfree(&self, cpu: CpuId, ptr: VirtAddr, behavior: AllocBehavior) {
        if ptr == 0 {
            return;
        }

        let local = self.local_domain_id(cpu);
        SlabStats::bump(&self.domains[local].stats.free_calls);

        let vpage = ptr & !(PAGE_BYTES - 1);
        let Some(owner) = self.owner.with_lock(|o| o.get(&vpage).copied()) else {
            assert_eq!(
                self.store.read_u64(vpage),
                KMALLOC_PAGE_MAGIC,
                "free of unknown address {ptr:#x}"
            );
            self.kfree_pages(cpu, vpage, behavior);
            if behavior.may_fault() {
                self.drain_free_queue(cpu, local, 100);
            }
            return;
        };

        let (class, pageable) = self.slab_info(owner, vpage);

        // Local non-pageable objects go straight to our magazine.
        if owner == local && !pageable && self.percpu[cpu].mags[class].push(ptr) {
            SlabStats::bump(&self.domains[owner].stats.frees_to_magazine);
            return;
        }

        // Someone else's memory: try their CPUs' magazines without spinning.
        if !pageable {
            let owner_cpus = self.domain_set.topology().numa_cpus(owner).clone();
            for owner_cpu in owner_cpus.iter() {
                if self.percpu[owner_cpu].mags[class].try_push(ptr) {
                    SlabStats::bump(&self.domains[owner].stats.frees_to_magazine);
                    return;
                }
            }
        }

        if self.free_queue_enqueue(cpu, owner, ptr, true, behavior) {
            return;
        }

        self.slab_free_obj(owner, ptr);

        if behavior.may_fault() {
            self.drain_free_queue(cpu, local, 100);
        }
    }
}
