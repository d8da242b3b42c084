use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-test-and-set spinlock flag.
///
/// `RawSpin` busy-waits until the lock becomes available. It is not fair and
/// not reentrant; spinning threads burn cycles until the holder releases.
/// Keep critical sections short.
///
/// # Examples
///
/// ```
/// use kernel_sync::RawSpin;
///
/// let lock = RawSpin::new();
/// lock.lock();
/// // critical section
/// unsafe { lock.unlock(); }
/// ```
pub struct RawSpin {
    /// Whether the lock is currently held.
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    /// Creates a new unlocked `RawSpin`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    #[inline]
    pub fn lock(&self) {
        // Try once, then spin on a plain load to avoid cache-line ping-pong.
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `true` if the lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Returns whether the lock is currently held by someone.
    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// Must only be called by the holder of the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}
