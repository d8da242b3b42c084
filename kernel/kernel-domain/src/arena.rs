use kernel_buddy::Pfn;
use kernel_sync::SpinLock;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

struct Ring {
    slots: Vec<Pfn>,
    head: usize,
    tail: usize,
}

/// Bounded per-core cache of single free pages.
///
/// One ring slot is always left empty to distinguish full from empty, so a
/// capacity-`n` arena holds `n - 1` pages.
pub struct PageArena {
    ring: SpinLock<Ring>,
    num_pages: AtomicUsize,
    capacity: usize,
}

impl PageArena {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            ring: SpinLock::new(Ring {
                slots: vec![0; capacity],
                head: 0,
                tail: 0,
            }),
            num_pages: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Pushes a free page; `false` when the arena is full.
    pub fn push(&self, pfn: Pfn) -> bool {
        let pushed = self.ring.with_lock(|r| {
            let next = (r.tail + 1) % self.capacity;
            if next == r.head {
                return false;
            }
            r.slots[r.tail] = pfn;
            r.tail = next;
            true
        });
        if pushed {
            self.num_pages.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    /// Pops a cached page, if any.
    pub fn pop(&self) -> Option<Pfn> {
        let page = self.ring.with_lock(|r| {
            if r.head == r.tail {
                return None;
            }
            let pfn = r.slots[r.head];
            r.head = (r.head + 1) % self.capacity;
            Some(pfn)
        });
        if page.is_some() {
            self.num_pages.fetch_sub(1, Ordering::Relaxed);
        }
        page
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num_pages.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots remaining.
    #[must_use]
    pub fn available(&self) -> usize {
        (self.capacity - 1).saturating_sub(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_push_pop() {
        let a = PageArena::new(4);
        assert!(a.push(1));
        assert!(a.push(2));
        assert!(a.push(3));
        assert!(!a.push(4), "capacity-1 slots usable");
        assert_eq!(a.pop(), Some(1));
        assert_eq!(a.pop(), Some(2));
        assert_eq!(a.pop(), Some(3));
        assert_eq!(a.pop(), None);
    }

    #[test]
    fn counters_track_occupancy() {
        let a = PageArena::new(8);
        assert_eq!(a.available(), 7);
        a.push(9);
        assert_eq!(a.len(), 1);
        assert_eq!(a.available(), 6);
    }
}
