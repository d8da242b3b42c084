use core::sync::atomic::{AtomicU64, Ordering};

/// Process-wide jitter state for lock backoff; decorrelates spinners
/// without per-lock PRNG storage.
static DELAY_SEED: AtomicU64 = AtomicU64::new(0x243F_6A88_85A3_08D3);

fn next_seed() -> u64 {
    let mut x = DELAY_SEED.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    DELAY_SEED.store(x, Ordering::Relaxed);
    x
}

/// Spins for roughly `backoff` iterations, varied by `jitter_pct` percent
/// either way so contending CPUs drift apart.
pub fn lock_delay(backoff: u64, jitter_pct: u64) {
    let jitter_span = backoff * jitter_pct / 100;
    let jitter = if jitter_span == 0 {
        0
    } else {
        next_seed() % (2 * jitter_span + 1)
    };
    let total = backoff - jitter_span + jitter;

    for _ in 0..total {
        core::hint::spin_loop();
    }
}
