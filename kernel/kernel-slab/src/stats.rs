use core::sync::atomic::{AtomicU64, Ordering};

/// Per-domain slab counters. Policy inputs and diagnostics only.
#[derive(Debug, Default)]
pub struct SlabStats {
    pub alloc_calls: AtomicU64,
    pub free_calls: AtomicU64,
    pub magazine_hits: AtomicU64,
    pub local_cache_hits: AtomicU64,
    pub remote_cache_hits: AtomicU64,
    pub page_allocs: AtomicU64,
    pub new_slabs: AtomicU64,
    pub frees_to_magazine: AtomicU64,
    pub frees_to_ring: AtomicU64,
    pub frees_to_list: AtomicU64,
    pub gc_reclaims: AtomicU64,
    pub failures: AtomicU64,
}

impl SlabStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocation plus free traffic, for the busyness probe.
    #[must_use]
    pub fn ops(&self) -> u64 {
        self.alloc_calls.load(Ordering::Relaxed) + self.free_calls.load(Ordering::Relaxed)
    }
}
