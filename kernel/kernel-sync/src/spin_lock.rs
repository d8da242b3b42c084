use crate::RawSpin;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A value protected by a [`RawSpin`].
///
/// Access is granted either through an RAII [`SpinLockGuard`] or through
/// [`with_lock`](Self::with_lock), which releases on closure return. The
/// guard form is what most of the core uses; `with_lock` keeps short hot-path
/// critical sections tidy.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinLock;
///
/// let l = SpinLock::new(0u32);
/// {
///     let mut g = l.lock();
///     *g = 41;
/// } // guard drops, unlocking
/// assert_eq!(l.with_lock(|v| *v + 1), 42);
/// ```
///
/// # Concurrency & Safety
///
/// `Sync` is implemented when `T: Send`; the raw lock provides mutual
/// exclusion and acquire/release ordering for the protected value.
pub struct SpinLock<T> {
    raw: RawSpin,
    /// The protected value.
    cell: UnsafeCell<T>,
}

// Safety: mutual exclusion is provided by `raw`; data may cross threads if T: Send.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpin::new(),
            cell: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock and returns a guard that unlocks on drop.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Executes `f` with exclusive access to the inner value.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Returns whether the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.raw.is_held()
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// `&mut self` guarantees exclusive access, so no locking is needed.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinLock");
        match self.try_lock() {
            Some(guard) => d.field("data", &*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

/// A guard that releases a [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: the guard was created by a successful acquisition.
        unsafe { self.lock.raw.unlock() }
    }
}
