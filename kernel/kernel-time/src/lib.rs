//! # Kernel time source
//!
//! The core consumes time through the [`Clock`] trait rather than a platform
//! timer directly. `now_ms` is the calibrated millisecond clock; `now_ms_fast`
//! is the cheaper variant interrupt handlers may use, permitted to lag behind
//! `now_ms` by a tick.
//!
//! [`ManualClock`] is the deterministic implementation used by the scheduler
//! and allocator tests: the embedder advances it explicitly.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds since boot.
pub type TimeMs = u64;

/// Source of monotonic kernel time.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> TimeMs;

    /// Cheap read usable at high IRQL. May lag `now_ms` slightly.
    fn now_ms_fast(&self) -> TimeMs {
        self.now_ms()
    }
}

/// Shared handle to the boot-selected clock.
pub type ClockRef = Arc<dyn Clock>;

/// A clock advanced explicitly by the embedder.
///
/// # Examples
///
/// ```
/// use kernel_time::{Clock, ManualClock};
///
/// let c = ManualClock::new();
/// c.advance(250);
/// assert_eq!(c.now_ms(), 250);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new() -> Self {
        Self { ms: AtomicU64::new(0) }
    }

    /// Advances the clock by `delta` milliseconds.
    pub fn advance(&self, delta: TimeMs) {
        self.ms.fetch_add(delta, Ordering::Release);
    }

    /// Jumps the clock to `ms` if that moves it forward.
    pub fn advance_to(&self, ms: TimeMs) {
        self.ms.fetch_max(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimeMs {
        self.ms.load(Ordering::Acquire)
    }
}

/// Calibration of the busy-wait loop: spins per microsecond.
const SPINS_PER_US: u64 = 64;

/// Busy-waits roughly `us` microseconds without touching the scheduler.
/// The only delay permitted at high IRQL, where blocking is forbidden.
pub fn busy_sleep_us(us: u64) {
    for _ in 0..us.saturating_mul(SPINS_PER_US) {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_monotonically() {
        let c = ManualClock::new();
        assert_eq!(c.now_ms(), 0);
        c.advance(10);
        c.advance(5);
        assert_eq!(c.now_ms(), 15);
        c.advance_to(12);
        assert_eq!(c.now_ms(), 15, "advance_to never goes backwards");
        c.advance_to(40);
        assert_eq!(c.now_ms(), 40);
    }

    #[test]
    fn fast_read_matches_default() {
        let c = ManualClock::new();
        c.advance(7);
        assert_eq!(c.now_ms_fast(), 7);
    }
}
