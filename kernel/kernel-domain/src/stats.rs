use core::sync::atomic::{AtomicU64, Ordering};

/// Per-domain allocation counters.
///
/// Relaxed counters; they feed policy heuristics and diagnostics, never
/// correctness decisions.
#[derive(Debug, Default)]
pub struct DomainStats {
    pub alloc_count: AtomicU64,
    pub free_count: AtomicU64,
    pub remote_alloc_count: AtomicU64,
    pub interleaved_alloc_count: AtomicU64,
    pub failed_alloc_count: AtomicU64,
}

impl DomainStats {
    pub fn record_alloc(&self, remote: bool, interleaved: bool) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        if remote {
            self.remote_alloc_count.fetch_add(1, Ordering::Relaxed);
        }
        if interleaved {
            self.interleaved_alloc_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_alloc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total operations ever recorded; used by the remote-busyness probe.
    #[must_use]
    pub fn ops(&self) -> u64 {
        self.alloc_count.load(Ordering::Relaxed) + self.free_count.load(Ordering::Relaxed)
    }
}
