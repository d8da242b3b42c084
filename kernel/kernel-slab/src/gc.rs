use crate::cache::DomainSlabs;
use crate::{SLAB_CLASS_COUNT};
use bitflags::bitflags;
use kernel_time::TimeMs;
use kernel_vas::VirtAddr;

bitflags! {
    /// Mode bits of one GC pass.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GcFlags: u32 {
        /// Every surviving candidate is destroyed, never recycled.
        const FORCE_DESTROY = 1 << 0;
        /// Candidates may be recycled but never destroyed.
        const SKIP_DESTROY = 1 << 1;
        /// Stop at the first unfit slab instead of tolerating a run.
        const FAST = 1 << 2;
    }
}

/// How hard a pass works the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GcAggressiveness {
    Relaxed,
    #[default]
    Normal,
    Emergency,
}

impl GcAggressiveness {
    /// Fraction of queued slabs examined per pass, and the cap.
    const fn scan_pct(self) -> usize {
        match self {
            Self::Relaxed => 25,
            Self::Normal => 50,
            Self::Emergency => 100,
        }
    }

    const fn scan_max(self) -> usize {
        match self {
            Self::Relaxed => 16,
            Self::Normal => 64,
            Self::Emergency => 256,
        }
    }

    /// Divisor of the unfit-run tolerance.
    const fn unfit_divisor(self) -> usize {
        match self {
            Self::Relaxed => 4,
            Self::Normal => 2,
            Self::Emergency => 1,
        }
    }

    const fn age_pct(self) -> u64 {
        match self {
            Self::Relaxed => 100,
            Self::Normal => 100,
            Self::Emergency => 150,
        }
    }

    const fn size_pct(self) -> u64 {
        match self {
            Self::Relaxed | Self::Normal => 100,
            Self::Emergency => 150,
        }
    }

    const fn recycle_pct(self) -> u64 {
        match self {
            Self::Relaxed => 100,
            Self::Normal => 75,
            Self::Emergency => 25,
        }
    }
}

/// A full GC request.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcRequest {
    pub aggressiveness: GcAggressiveness,
    pub flags: GcFlags,
    /// Bias toward destruction, 0..16; shifts the score threshold down.
    pub destroy_bias: u8,
    /// Classes the recycler should favor, one bit per class order.
    pub order_bias: u32,
    /// With FORCE_DESTROY: stop after freeing this many slabs.
    pub destroy_target: usize,
}

impl Default for GcFlags {
    fn default() -> Self {
        Self::empty()
    }
}

const GC_AGE_FACTOR: u64 = 1;
const GC_SIZE_FACTOR: u64 = 64;
const GC_RECYCLE_PENALTY: u64 = 128;
const GC_SCORE_SCALE: i64 = 1024;
const GC_SCORE_MIN_DELTA: u64 = 1;
const GC_WEIGHT_UNDER_SUPPLY: i64 = 4;
const GC_WEIGHT_RECYCLED: i64 = 2;
const GC_WEIGHT_ORDER_PREFERRED: i64 = 2;
const DESTROY_BIAS_MAX: u64 = 16;

/// Collection score of a parked slab: old, large, rarely-recycled slabs
/// score high and are reclaimed first.
#[must_use]
pub fn gc_score(
    now: TimeMs,
    enqueue_ms: TimeMs,
    pages: u64,
    recycles: u64,
    agg: GcAggressiveness,
) -> u64 {
    let age_part = now.saturating_sub(enqueue_ms) * GC_AGE_FACTOR * agg.age_pct() / 100;
    let size_part = GC_SIZE_FACTOR * pages * agg.size_pct() / 100;
    let recycle_part = GC_RECYCLE_PENALTY * recycles * agg.recycle_pct() / 100;
    (age_part + size_part).saturating_sub(recycle_part)
}

/// Whether a candidate should be recycled into another cache rather than
/// destroyed: recycle while this class is under-supplied relative to the
/// group, scaled by the destroy bias.
#[must_use]
pub fn should_recycle(slabs: &DomainSlabs, vpage: VirtAddr, destroy_bias: u8) -> bool {
    let meta = &slabs.slabs[&vpage];
    let class_free = slabs.lists(meta.pageable, meta.class).free.len() * 100;
    let total_free = slabs.total_free_slabs(meta.pageable) * 100;
    let avg = total_free / SLAB_CLASS_COUNT;

    // Higher bias scales the keep-thresholds down toward destruction.
    let bias = (100u64.saturating_sub(u64::from(destroy_bias) * 5)).max(25);

    let below_free_ratio = (class_free as u64) < total_free as u64 * 40 * bias / (100 * 100);
    let below_average = (class_free as u64) < avg as u64 * bias / 100;
    below_free_ratio || below_average
}

/// Picks the class a recycled slab should serve next: prefer the original
/// order, then under-supplied orders, penalizing orders this pass has
/// already refilled.
#[must_use]
pub fn pick_recycle_class(
    slabs: &DomainSlabs,
    vpage: VirtAddr,
    recycled_so_far: &[usize; SLAB_CLASS_COUNT],
    order_bias: u32,
) -> usize {
    let meta = &slabs.slabs[&vpage];
    let original = meta.class;
    let pageable = meta.pageable;

    let free_per_order: [usize; SLAB_CLASS_COUNT] =
        core::array::from_fn(|c| slabs.lists(pageable, c).free.len());
    let total_free: usize = free_per_order.iter().sum();

    let mut best = original;
    let mut best_score = i64::MIN;
    for class in 0..SLAB_CLASS_COUNT {
        let inv_free = if total_free == 0 {
            GC_SCORE_SCALE
        } else {
            let others = (total_free - free_per_order[class]) as i64;
            let mut scaled = others * GC_SCORE_SCALE;
            if order_bias & (1 << class) != 0 {
                scaled *= 4;
            }
            scaled / (1 + total_free as i64)
        };

        let recycled = recycled_so_far[class] as i64;
        let recycled_part = recycled * GC_SCORE_SCALE / (recycled + 1);
        let mut score =
            GC_WEIGHT_UNDER_SUPPLY * inv_free - GC_WEIGHT_RECYCLED * recycled_part;

        if class == original {
            score += GC_WEIGHT_ORDER_PREFERRED * GC_SCORE_SCALE;
        } else {
            score -= (class as i64 - original as i64).abs();
        }

        if score > best_score {
            best_score = score;
            best = class;
        }
    }
    best
}

/// Outcome of one pass, for stats and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub examined: usize,
    pub recycled: usize,
    pub destroyed: usize,
}

/// Walks the GC tree oldest-first and decides, per candidate, whether to
/// recycle it into an under-supplied cache or hand it back for destruction.
///
/// Destruction itself (returning pages to the buddy, unmapping) is the
/// caller's job: the returned list holds the vpages to destroy, already
/// detached from the registry view of the GC tree.
pub fn gc_plan(
    slabs: &mut DomainSlabs,
    now: TimeMs,
    req: &GcRequest,
) -> (GcOutcome, alloc::vec::Vec<VirtAddr>) {
    let mut outcome = GcOutcome::default();
    let mut to_destroy = alloc::vec::Vec::new();

    let agg = req.aggressiveness;
    let queued = slabs.gc_len();
    if queued == 0 {
        return (outcome, to_destroy);
    }

    let target = (queued * agg.scan_pct() / 100).min(agg.scan_max()).max(1);
    let max_unfit = (target / agg.unfit_divisor()).max(1);

    // Score range establishes the pass threshold.
    let keys: alloc::vec::Vec<(TimeMs, VirtAddr)> = slabs.gc.keys().copied().collect();
    let score_of = |slabs: &DomainSlabs, key: &(TimeMs, VirtAddr)| {
        let meta = &slabs.slabs[&key.1];
        gc_score(now, meta.gc_enqueue_ms, 1, meta.recycle_count, agg)
    };
    let min_key = keys.first().unwrap();
    let max_key = keys.last().unwrap();
    // Oldest slabs carry the highest scores.
    let max_score = score_of(slabs, min_key);
    let mut min_score = score_of(slabs, max_key);
    if min_score >= max_score {
        min_score = max_score.saturating_sub(GC_SCORE_MIN_DELTA);
    }
    let score_delta = max_score - min_score;
    let threshold =
        max_score / 2 + score_delta * u64::from(req.destroy_bias) / DESTROY_BIAS_MAX * 2;

    let mut recycled_per_class = [0usize; SLAB_CLASS_COUNT];
    let mut consecutive_unfit = 0usize;

    for key in keys {
        if outcome.recycled + outcome.destroyed >= target {
            break;
        }
        if !slabs.gc.contains_key(&key) {
            continue;
        }
        outcome.examined += 1;

        let score = score_of(slabs, &key);
        if score < threshold {
            consecutive_unfit += 1;
            if consecutive_unfit >= max_unfit || req.flags.contains(GcFlags::FAST) {
                break;
            }
            continue;
        }
        consecutive_unfit = 0;

        let vpage = key.1;
        slabs.gc.remove(&key);

        if req.flags.contains(GcFlags::FORCE_DESTROY) {
            to_destroy.push(vpage);
            outcome.destroyed += 1;
            if req.destroy_target > 0 && outcome.destroyed >= req.destroy_target {
                break;
            }
            continue;
        }

        if should_recycle(slabs, vpage, req.destroy_bias) {
            let class = pick_recycle_class(slabs, vpage, &recycled_per_class, req.order_bias);
            let pageable = slabs.slabs[&vpage].pageable;
            let meta = slabs.slabs.get_mut(&vpage).unwrap();
            meta.recycle_count += 1;
            meta.reinit(class, pageable);
            meta.state = crate::meta::SlabState::InGcList; // move_slab fixes lists
            slabs.move_slab(vpage, crate::meta::SlabState::Free);
            recycled_per_class[class] += 1;
            outcome.recycled += 1;
        } else if req.flags.contains(GcFlags::SKIP_DESTROY) {
            // Leave it parked.
            slabs.gc.insert(key, ());
        } else {
            to_destroy.push(vpage);
            outcome.destroyed += 1;
        }
    }

    (outcome, to_destroy)
}
