//! Priority, weight and slice math for timeshare threads.

use crate::activity::ActivityMetrics;
use crate::state::{ActivityClass, PrioClass};

/// Width of one activity band.
pub const CLASS_WIDTH: u32 = 1024;
const CLASS_HALF: u32 = CLASS_WIDTH / 2;

pub const ACT_INTERACTIVE_AVG: u32 = 4000;
pub const ACT_IO_BOUND_AVG: u32 = 2500;
pub const ACT_CPU_BOUND_AVG: u32 = 1200;
pub const ACT_SLEEPY_AVG: u32 = 4500;

/// Base unit of dynamic-delta arithmetic.
pub const DELTA_UNIT: i64 = 1 << 3;
/// Clamp for the signed dynamic delta.
pub const DELTA_MAX: i64 = 1 << 9;
/// CPU-bound penalty per accounting pass.
pub const PENALTY_CPU_RUN: i64 = 3 * DELTA_UNIT;
/// Effective-priority movement below this does not force a reinsert.
pub const REINSERT_THRESHOLD: i64 = 8 * DELTA_UNIT;
/// Reclassification hysteresis.
pub const HYSTERESIS_MS: u64 = 250;

pub const MIN_PERIOD_MS: u64 = 20;
pub const MAX_PERIOD_MS: u64 = 300;
pub const BASE_PERIOD_MS: u64 = 50;
pub const MIN_SLICE_MS: u64 = 2;

pub const SLICE_MIN: u64 = 1;
pub const SLICE_MAX: u64 = 16;

pub const BASE_WEIGHT: i64 = 1024;
pub const WEIGHT_SCALING: i64 = 100;

/// `1.022` in 16.16 fixed point, the niceness base.
const NICE_BASE_FP: i64 = 66_978;
const FP_ONE: i64 = 1 << 16;

/// Classifies the last window of behavior.
#[must_use]
pub fn classify_activity(m: ActivityMetrics) -> ActivityClass {
    if m.run_ratio > 80 && m.block_ratio < 10 {
        return ActivityClass::CpuBound;
    }
    if m.block_ratio > 40 && m.wake_freq > 2 {
        return ActivityClass::IoBound;
    }
    if m.wake_freq > 5 {
        return ActivityClass::Interactive;
    }
    if m.sleep_ratio > 50 {
        return ActivityClass::Sleepy;
    }
    // Keep the rest of the scheduler away from Unknown.
    ActivityClass::CpuBound
}

/// Score band of an activity class.
#[must_use]
pub const fn class_band(class: ActivityClass) -> (u32, u32) {
    let avg = match class {
        ActivityClass::Interactive => ACT_INTERACTIVE_AVG,
        ActivityClass::IoBound => ACT_IO_BOUND_AVG,
        ActivityClass::CpuBound => ACT_CPU_BOUND_AVG,
        ActivityClass::Sleepy | ActivityClass::Unknown => ACT_SLEEPY_AVG,
    };
    (avg - CLASS_HALF, avg + CLASS_HALF)
}

/// Wake-boost multiplier per activity class.
#[must_use]
pub const fn class_multiplier(class: ActivityClass) -> i64 {
    match class {
        ActivityClass::Interactive => 3,
        ActivityClass::IoBound => 2,
        ActivityClass::CpuBound | ActivityClass::Sleepy | ActivityClass::Unknown => 1,
    }
}

/// Percentage score of how interactive the window looked.
#[must_use]
pub fn activity_score_pct(m: ActivityMetrics) -> u32 {
    let wake_norm = if m.wake_freq > 20 {
        100
    } else {
        u32::from(m.wake_freq) * 5
    };
    let interactive_pct = wake_norm * (100 - u32::from(m.block_ratio)) / 100;
    let cpu_factor = 100 - u32::from(m.run_ratio);
    let score_pct = interactive_pct * cpu_factor / 100;
    (score_pct + score_pct / 8).min(100)
}

/// Delta change applied on a wake, before jitter.
#[must_use]
pub fn wake_boost_delta(m: ActivityMetrics, class: ActivityClass) -> i64 {
    i64::from(activity_score_pct(m)) * DELTA_UNIT * class_multiplier(class) / 100
}

/// CPU penalty, scaled by run ratio and relieved by wake frequency.
#[must_use]
pub fn cpu_penalty(m: ActivityMetrics) -> i64 {
    let run_scale = i64::from(m.run_ratio);
    let wake_scale = (i64::from(m.wake_freq) * 2).min(100);
    let mut penalty = PENALTY_CPU_RUN * run_scale / 100;
    penalty -= PENALTY_CPU_RUN * wake_scale / 200;
    penalty.max(1)
}

/// Decays the dynamic delta by 10/11.
#[must_use]
pub const fn decay_delta(delta: i64) -> i64 {
    delta * 1000 / 1100
}

/// Niceness weight factor in 16.16 fixed point: `1.022^(-niceness)`, so a
/// negative niceness raises the weight and a positive one lowers it.
#[must_use]
pub fn nice_factor(niceness: i8) -> i64 {
    let mut acc = FP_ONE;
    for _ in 0..niceness.unsigned_abs() {
        acc = acc * NICE_BASE_FP / FP_ONE;
    }
    if niceness < 0 { acc } else { FP_ONE * FP_ONE / acc }
}

/// Timeshare weight from the window metrics, delta and niceness.
#[must_use]
pub fn base_weight(m: ActivityMetrics, dynamic_delta: i64, niceness: i8) -> u64 {
    let mut w = BASE_WEIGHT;
    w += i64::from(m.wake_freq) * WEIGHT_SCALING;
    w += (WEIGHT_SCALING - i64::from(m.run_ratio)) * (WEIGHT_SCALING / 2);
    w += dynamic_delta / WEIGHT_SCALING;

    if niceness != 0 {
        w = (w * nice_factor(niceness)) >> 16;
    }
    w.max(1) as u64
}

/// Effective activity score clamped into the class band.
#[must_use]
pub fn effective_score(class: ActivityClass, dynamic_delta: i64) -> u32 {
    let (min, max) = class_band(class);
    let avg = i64::from(min + max) / 2;
    let eff = (avg + dynamic_delta).clamp(i64::from(min), i64::from(max));
    eff as u32
}

/// Maps an activity score onto a slice count.
#[must_use]
pub fn map_activity_score(score: u32) -> u64 {
    let min_score = ACT_SLEEPY_AVG - CLASS_HALF;
    let max_score = ACT_INTERACTIVE_AVG + CLASS_HALF;
    let clamped = score.clamp(min_score, max_score);
    let delta = u64::from(clamped - min_score);
    let range = u64::from(max_score - min_score);
    1 + delta * (SLICE_MAX - SLICE_MIN) / range
}

/// Slice count with small adjustments from the window ratios.
#[must_use]
pub fn derive_slice_count(score: u32, m: ActivityMetrics) -> u64 {
    let base = map_activity_score(score) as i64;
    let mut adjust = 1i64;
    if m.block_ratio > m.run_ratio {
        adjust += 1;
    }
    if m.run_ratio > 70 {
        adjust -= 1;
    }
    if m.sleep_ratio > 70 {
        adjust -= 1;
    }
    (base + adjust).clamp(SLICE_MIN as i64, SLICE_MAX as i64) as u64
}

/// Period length for a given runnable count.
#[must_use]
pub fn compute_period_ms(thread_count: usize) -> u64 {
    (BASE_PERIOD_MS + thread_count as u64 * 2).clamp(MIN_PERIOD_MS, MAX_PERIOD_MS)
}

/// Turnstile priority of a thread: classes collapse onto bands, timeshare
/// spreads by weight.
#[must_use]
pub fn turnstile_priority(class: PrioClass, weight: u64) -> i64 {
    match class {
        PrioClass::Background => 1,
        PrioClass::Timeshare => (2 + weight as i64).min(1000),
        PrioClass::Rt => 1001,
        PrioClass::Urgent => 1002,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(run: u8, block: u8, sleep: u8, wake: u8) -> ActivityMetrics {
        ActivityMetrics {
            run_ratio: run,
            block_ratio: block,
            sleep_ratio: sleep,
            wake_freq: wake,
        }
    }

    #[test]
    fn classification_rules() {
        assert_eq!(classify_activity(metrics(90, 5, 0, 0)), ActivityClass::CpuBound);
        assert_eq!(classify_activity(metrics(20, 50, 0, 4)), ActivityClass::IoBound);
        assert_eq!(classify_activity(metrics(20, 20, 0, 9)), ActivityClass::Interactive);
        assert_eq!(classify_activity(metrics(10, 10, 70, 0)), ActivityClass::Sleepy);
        assert_eq!(classify_activity(metrics(50, 20, 10, 1)), ActivityClass::CpuBound);
    }

    #[test]
    fn period_is_clamped() {
        assert_eq!(compute_period_ms(0), 50);
        assert_eq!(compute_period_ms(200), MAX_PERIOD_MS);
    }

    #[test]
    fn interactive_boost_beats_cpu_bound() {
        let interactive = wake_boost_delta(metrics(10, 5, 0, 12), ActivityClass::Interactive);
        let cpu = wake_boost_delta(metrics(95, 0, 0, 0), ActivityClass::CpuBound);
        assert!(interactive > cpu);
    }

    #[test]
    fn nice_factor_is_monotonic() {
        assert!(nice_factor(0) == FP_ONE);
        assert!(nice_factor(5) < FP_ONE);
        assert!(nice_factor(-5) > FP_ONE);
        assert!(nice_factor(-20) > nice_factor(-10));
    }

    #[test]
    fn negative_niceness_raises_weight() {
        let m = metrics(50, 20, 10, 2);
        let neutral = base_weight(m, 0, 0);
        assert!(base_weight(m, 0, -10) > neutral);
        assert!(base_weight(m, 0, 10) < neutral);
    }

    #[test]
    fn slice_counts_stay_in_range() {
        for score in [0u32, 1200, 4000, 4500, 9000] {
            for m in [metrics(90, 0, 0, 0), metrics(10, 80, 0, 8), metrics(5, 5, 90, 0)] {
                let n = derive_slice_count(score, m);
                assert!((SLICE_MIN..=SLICE_MAX).contains(&n));
            }
        }
    }

    #[test]
    fn turnstile_priority_ordering() {
        assert!(turnstile_priority(PrioClass::Urgent, 1) > turnstile_priority(PrioClass::Rt, 1));
        assert!(
            turnstile_priority(PrioClass::Rt, 1) > turnstile_priority(PrioClass::Timeshare, 5000)
        );
        assert!(
            turnstile_priority(PrioClass::Timeshare, 10) > turnstile_priority(PrioClass::Background, 1)
        );
    }

    #[test]
    fn decay_shrinks_toward_zero() {
        assert_eq!(decay_delta(0), 0);
        assert!(decay_delta(512) < 512);
        assert!(decay_delta(-512) > -512);
    }
}
