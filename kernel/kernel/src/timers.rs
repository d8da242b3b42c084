use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_lock::Condvar;
use kernel_sync::SpinLock;
use kernel_thread::ThreadRef;
use kernel_time::TimeMs;

/// What a due timer does.
pub enum TimerFire {
    /// End of a `sleep_ms`: wake the sleeper with its armed token.
    SleepWake { token: u64, thread: ThreadRef },
    /// A condvar wait timed out.
    CondvarTimeout { cv: Arc<Condvar>, thread: ThreadRef },
}

/// Absolute-time timer store, popped from the tick.
pub struct TimerWheel {
    entries: SpinLock<BTreeMap<(TimeMs, u64), TimerFire>>,
    seq: AtomicU64,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
            seq: AtomicU64::new(1),
        }
    }

    /// Mints a wake-source token for an uninterruptible timed wait.
    pub fn new_token(&self) -> u64 {
        // High bit distinguishes timer tokens from lock keys.
        self.seq.fetch_add(1, Ordering::Relaxed) | (1 << 63)
    }

    pub fn arm_sleep(&self, due: TimeMs, token: u64, thread: ThreadRef) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .with_lock(|e| e.insert((due, seq), TimerFire::SleepWake { token, thread }));
    }

    pub fn arm_condvar_timeout(&self, due: TimeMs, cv: Arc<Condvar>, thread: ThreadRef) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .with_lock(|e| e.insert((due, seq), TimerFire::CondvarTimeout { cv, thread }));
    }

    /// Removes and returns every timer due at `now`.
    pub fn take_due(&self, now: TimeMs) -> Vec<TimerFire> {
        self.entries.with_lock(|e| {
            let mut due = Vec::new();
            while let Some(entry) = e.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove());
            }
            due
        })
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.with_lock(|e| e.len())
    }
}
