use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Minimal grace-period tracking for the reaper.
///
/// Every CPU reports quiescence from its tick; a grace period opened at
/// generation `g` has elapsed once every CPU has reported at `g` or later.
/// Zombie threads are only freed after the grace period opened at their
/// death has elapsed, so a stale reference picked up just before the death
/// cannot be yanked away.
pub struct RcuState {
    generation: AtomicU64,
    reported: Vec<AtomicU64>,
}

impl RcuState {
    #[must_use]
    pub fn new(cpus: usize) -> Self {
        Self {
            generation: AtomicU64::new(1),
            reported: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Opens a new grace period, returning its generation.
    pub fn start_grace(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Called from each CPU's tick at a quiescent point.
    pub fn quiescent(&self, cpu: usize) {
        let r#gen = self.generation.load(Ordering::Acquire);
        self.reported[cpu].store(r#gen, Ordering::Release);
    }

    /// Whether the grace period opened at `generation` has elapsed.
    #[must_use]
    pub fn grace_elapsed(&self, generation: u64) -> bool {
        self.reported
            .iter()
            .all(|r| r.load(Ordering::Acquire) >= generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_requires_every_cpu() {
        let rcu = RcuState::new(2);
        let g = rcu.start_grace();
        assert!(!rcu.grace_elapsed(g));
        rcu.quiescent(0);
        assert!(!rcu.grace_elapsed(g), "cpu 1 has not passed through");
        rcu.quiescent(1);
        assert!(rcu.grace_elapsed(g));
    }

    #[test]
    fn stale_reports_do_not_satisfy_newer_grace() {
        let rcu = RcuState::new(1);
        let g1 = rcu.start_grace();
        rcu.quiescent(0);
        assert!(rcu.grace_elapsed(g1));
        let g2 = rcu.start_grace();
        assert!(!rcu.grace_elapsed(g2));
    }
}
