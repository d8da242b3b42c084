//! Activity tracking: event rings, time buckets and the derived metrics
//! that feed classification and weighting.
//!
//! Every wake, block and sleep event lands in a small ring; wakes carry a
//! cross-link back to the block or sleep they end, validated by a cycle
//! counter so a recycled slot cannot be paired with a stale event. Bucket
//! rotation aggregates the last four one-second windows.

use crate::state::WakeReason;
use kernel_time::TimeMs;

/// Buckets in the sliding window.
pub const BUCKET_COUNT: usize = 4;
/// Wall-clock span of one bucket.
pub const BUCKET_DURATION_MS: u64 = 1000;
/// Events kept per ring; matches the bucket count.
pub const EVENT_RING_CAPACITY: usize = BUCKET_COUNT;
/// Full window span.
pub const TOTAL_BUCKET_DURATION_MS: u64 = BUCKET_COUNT as u64 * BUCKET_DURATION_MS;

const NO_ASSOC: u8 = 0xFF;

/// Link from a wake back to the block/sleep event it ended.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventAssoc {
    pub slot: u8,
    pub cycle: u64,
}

/// One recorded event.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventSlot {
    pub reason: u8,
    pub timestamp: TimeMs,
    pub cycle: u64,
    pub assoc: EventAssoc,
}

/// Fixed-capacity event ring.
#[derive(Clone, Debug, Default)]
pub struct EventRing {
    pub slots: [EventSlot; EVENT_RING_CAPACITY],
    pub head: usize,
}

impl EventRing {
    /// Appends an event, recycling the oldest slot. Returns the slot index.
    pub fn push(&mut self, reason: u8, now: TimeMs) -> usize {
        let idx = self.head % EVENT_RING_CAPACITY;
        let slot = &mut self.slots[idx];
        if slot.timestamp != 0 {
            slot.cycle += 1;
        }
        slot.reason = reason;
        slot.timestamp = now;
        slot.assoc = EventAssoc {
            slot: NO_ASSOC,
            cycle: 0,
        };
        self.head += 1;
        idx
    }

    /// Most recently pushed slot index, if any event was ever recorded.
    #[must_use]
    pub const fn latest(&self) -> Option<usize> {
        if self.head == 0 {
            None
        } else {
            Some((self.head - 1) % EVENT_RING_CAPACITY)
        }
    }
}

/// Runtime accumulated per wall-clock second.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeBucket {
    pub run_time_ms: u16,
    pub wall_clock_sec: u64,
}

/// Wake/block/sleep counts and durations of one window bucket.
#[derive(Clone, Copy, Debug, Default)]
pub struct ActivityBucket {
    pub cycle: u64,
    pub block_count: u32,
    pub sleep_count: u32,
    pub wake_count: u32,
    pub block_duration: u16,
    pub sleep_duration: u16,
}

impl ActivityBucket {
    fn clear(&mut self, cycle: u64) {
        *self = Self {
            cycle,
            ..Self::default()
        };
    }
}

/// Ratios and frequency derived from the window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityMetrics {
    pub run_ratio: u8,
    pub block_ratio: u8,
    pub sleep_ratio: u8,
    pub wake_freq: u8,
}

/// The full per-thread activity record.
#[derive(Clone, Debug, Default)]
pub struct ActivityStats {
    pub rt_buckets: [RuntimeBucket; BUCKET_COUNT],
    pub buckets: [ActivityBucket; BUCKET_COUNT],
    pub last_update_ms: TimeMs,
    pub current_cycle: u64,
    pub current_bucket: usize,
    pub last_wake_index: usize,
}

/// The three event rings.
#[derive(Clone, Debug, Default)]
pub struct ActivityData {
    pub wake_reasons: EventRing,
    pub block_reasons: EventRing,
    pub sleep_reasons: EventRing,
}

const fn bucket_index(ts: TimeMs) -> usize {
    ((ts / BUCKET_DURATION_MS) % BUCKET_COUNT as u64) as usize
}

impl ActivityStats {
    /// Rotates buckets forward to cover `now`.
    pub fn advance_to(&mut self, now: TimeMs) {
        if now <= self.last_update_ms {
            return;
        }
        let elapsed = now - self.last_update_ms;

        if elapsed >= TOTAL_BUCKET_DURATION_MS {
            // Jumped past the whole window; reset it.
            self.current_cycle += 1;
            self.current_bucket = bucket_index(now);
            let cycle = self.current_cycle;
            for b in &mut self.buckets {
                b.clear(cycle);
            }
            self.last_update_ms = now - (now % BUCKET_DURATION_MS);
            return;
        }

        let steps = (elapsed / BUCKET_DURATION_MS) as usize;
        if steps == 0 {
            return;
        }
        for i in 1..=steps.min(BUCKET_COUNT) {
            let idx = (self.current_bucket + i) % BUCKET_COUNT;
            if self.buckets[idx].cycle != self.current_cycle {
                let cycle = self.current_cycle;
                self.buckets[idx].clear(cycle);
            }
        }
        let new_bucket = self.current_bucket + steps;
        self.current_bucket = new_bucket % BUCKET_COUNT;
        if new_bucket >= BUCKET_COUNT {
            self.current_cycle += 1;
        }
        self.last_update_ms = now - (now % BUCKET_DURATION_MS);
    }

    /// Splits a run delta across the wall-clock seconds it spans.
    pub fn record_runtime(&mut self, run_start_ms: TimeMs, now: TimeMs) {
        if now <= run_start_ms {
            return;
        }
        let start_sec = run_start_ms / 1000;
        let end_sec = now / 1000;

        for sec in start_sec..=end_sec {
            let idx = (sec % BUCKET_COUNT as u64) as usize;
            let bucket = &mut self.rt_buckets[idx];
            if bucket.wall_clock_sec != sec {
                bucket.wall_clock_sec = sec;
                bucket.run_time_ms = 0;
            }

            let slice_start = if sec == start_sec { run_start_ms } else { sec * 1000 };
            let slice_end = if sec == end_sec { now } else { (sec + 1) * 1000 };
            bucket.run_time_ms = bucket
                .run_time_ms
                .saturating_add((slice_end - slice_start) as u16);
        }
    }

    /// Attributes a block/sleep interval `[start, end)` to the buckets it
    /// overlaps.
    fn attribute_interval(&mut self, wake: WakeReason, start: TimeMs, end: TimeMs) {
        let mut bucket_start = start - (start % BUCKET_DURATION_MS);
        let mut updated = 0;

        while bucket_start < end && updated < BUCKET_COUNT {
            let bucket_end = bucket_start + BUCKET_DURATION_MS;
            let idx = bucket_index(bucket_start);
            let eff_start = start.max(bucket_start);
            let eff_end = end.min(bucket_end);
            let overlap = eff_end.saturating_sub(eff_start) as u16;

            let cycle = self.current_cycle;
            let bucket = &mut self.buckets[idx];
            if bucket.cycle != cycle {
                bucket.clear(cycle);
            }
            if wake.is_from_block() {
                bucket.block_duration = bucket.block_duration.saturating_add(overlap);
            } else if wake.is_from_sleep() {
                bucket.sleep_duration = bucket.sleep_duration.saturating_add(overlap);
            }

            bucket_start += BUCKET_DURATION_MS;
            updated += 1;
        }
    }

    /// Folds wakes recorded since the last pass into durations.
    pub fn absorb_wakes(&mut self, data: &ActivityData, now: TimeMs) {
        self.advance_to(now);

        let head = data.wake_reasons.head;
        for i in self.last_wake_index..head {
            let idx = i % EVENT_RING_CAPACITY;
            let wake = data.wake_reasons.slots[idx];
            if wake.assoc.slot == NO_ASSOC {
                continue;
            }

            let reason = WakeReason::from_raw_u8(wake.reason);
            let source = if reason.is_from_block() {
                &data.block_reasons
            } else if reason.is_from_sleep() {
                &data.sleep_reasons
            } else {
                continue;
            };

            let start_evt = source.slots[usize::from(wake.assoc.slot) % EVENT_RING_CAPACITY];
            // A recycled slot invalidates the association.
            if start_evt.cycle != wake.assoc.cycle {
                continue;
            }
            let (start, end) = (start_evt.timestamp, wake.timestamp);
            assert!(start <= end, "corrupted event timestamps");
            self.attribute_interval(reason, start, end);
        }
        self.last_wake_index = head;
    }

    /// Ratios and wake frequency over the current window.
    #[must_use]
    pub fn metrics(&self) -> ActivityMetrics {
        let mut total_run: u64 = 0;
        let mut total_block: u64 = 0;
        let mut total_sleep: u64 = 0;
        let mut total_wakes: u64 = 0;

        for i in 0..BUCKET_COUNT {
            total_run += u64::from(self.rt_buckets[i].run_time_ms);
            total_block += u64::from(self.buckets[i].block_duration);
            total_sleep += u64::from(self.buckets[i].sleep_duration);
            total_wakes += u64::from(self.buckets[i].wake_count);
        }

        let total = (total_run + total_block + total_sleep).max(1);
        ActivityMetrics {
            run_ratio: (total_run * 100 / total) as u8,
            block_ratio: (total_block * 100 / total) as u8,
            sleep_ratio: (total_sleep * 100 / total) as u8,
            wake_freq: (total_wakes / BUCKET_COUNT as u64).min(255) as u8,
        }
    }
}

impl WakeReason {
    #[must_use]
    pub const fn from_raw_u8(v: u8) -> Self {
        match v {
            1 => Self::BlockingIo,
            2 => Self::BlockingManual,
            3 => Self::SleepTimeout,
            4 => Self::SleepManual,
            5 => Self::Signal,
            6 => Self::Timeout,
            _ => Self::None,
        }
    }
}

impl ActivityData {
    /// Records a wake and links it back to the block/sleep it ends.
    pub fn add_wake(&mut self, stats: &mut ActivityStats, reason: WakeReason, now: TimeMs) {
        let wake_idx = self.wake_reasons.push(reason as u8, now);

        stats.advance_to(now);
        stats.buckets[bucket_index(now)].wake_count += 1;

        let source = if reason.is_from_block() {
            self.block_reasons.latest()
        } else if reason.is_from_sleep() {
            self.sleep_reasons.latest()
        } else {
            None
        };

        if let Some(src_idx) = source {
            let (src_cycle, wake_cycle) = {
                let src_ring = if reason.is_from_block() {
                    &self.block_reasons
                } else {
                    &self.sleep_reasons
                };
                (
                    src_ring.slots[src_idx].cycle,
                    self.wake_reasons.slots[wake_idx].cycle,
                )
            };

            self.wake_reasons.slots[wake_idx].assoc = EventAssoc {
                slot: src_idx as u8,
                cycle: src_cycle,
            };
            let src_ring = if reason.is_from_block() {
                &mut self.block_reasons
            } else {
                &mut self.sleep_reasons
            };
            src_ring.slots[src_idx].assoc = EventAssoc {
                slot: wake_idx as u8,
                cycle: wake_cycle,
            };
        }

        stats.absorb_wakes(self, now);
    }

    /// Records a block event.
    pub fn add_block(&mut self, stats: &mut ActivityStats, reason: u8, now: TimeMs) {
        self.block_reasons.push(reason, now);
        stats.advance_to(now);
        stats.buckets[bucket_index(now)].block_count += 1;
    }

    /// Records a sleep event.
    pub fn add_sleep(&mut self, stats: &mut ActivityStats, reason: u8, now: TimeMs) {
        self.sleep_reasons.push(reason, now);
        stats.advance_to(now);
        stats.buckets[bucket_index(now)].sleep_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_links_back_to_block() {
        let mut data = ActivityData::default();
        let mut stats = ActivityStats::default();

        data.add_block(&mut stats, 2, 100);
        data.add_wake(&mut stats, WakeReason::BlockingManual, 400);

        let m = stats.metrics();
        assert!(m.block_ratio > 0, "300ms of block attributed");
    }

    #[test]
    fn runtime_splits_across_seconds() {
        let mut stats = ActivityStats::default();
        stats.record_runtime(900, 1100);
        assert_eq!(stats.rt_buckets[0].run_time_ms, 100);
        assert_eq!(stats.rt_buckets[1].run_time_ms, 100);
    }

    #[test]
    fn long_gap_resets_window() {
        let mut stats = ActivityStats::default();
        stats.buckets[0].wake_count = 9;
        stats.advance_to(10 * TOTAL_BUCKET_DURATION_MS);
        assert!(stats.buckets.iter().all(|b| b.wake_count == 0));
    }

    #[test]
    fn metrics_reflect_mixture() {
        let mut data = ActivityData::default();
        let mut stats = ActivityStats::default();

        // 1s of runtime, then a 1s sleep.
        stats.record_runtime(0, 1000);
        data.add_sleep(&mut stats, 1, 1000);
        data.add_wake(&mut stats, WakeReason::SleepManual, 2000);

        let m = stats.metrics();
        assert_eq!(u32::from(m.run_ratio) + u32::from(m.sleep_ratio), 100);
        assert!(m.sleep_ratio >= 49);
    }

    #[test]
    fn stale_association_is_ignored() {
        let mut data = ActivityData::default();
        let mut stats = ActivityStats::default();

        data.add_block(&mut stats, 2, 10);
        // Overwrite the block ring enough times to recycle slot cycles.
        for i in 0..(EVENT_RING_CAPACITY as u64) {
            data.add_block(&mut stats, 2, 20 + i);
        }
        // The wake links against the latest block, not the recycled one;
        // absorbing twice must not double-count.
        data.add_wake(&mut stats, WakeReason::BlockingManual, 50);
        let first = stats.metrics();
        stats.absorb_wakes(&data, 60);
        assert_eq!(first, stats.metrics());
    }
}
