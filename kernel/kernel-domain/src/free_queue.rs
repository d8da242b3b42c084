use kernel_buddy::PhysAddr;
use kernel_sync::SpinLock;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Clone, Copy, Default)]
struct Slot {
    addr: PhysAddr,
    pages: u64,
}

struct Ring {
    slots: Vec<Slot>,
    head: usize,
    tail: usize,
}

/// Per-domain bounded queue of pending frees.
///
/// Remote CPUs enqueue `{addr, page_count}` pairs here instead of taking the
/// remote buddy lock; the owning domain drains the queue into its arenas and
/// buddy on its own time.
pub struct DomainFreeQueue {
    ring: SpinLock<Ring>,
    num_elements: AtomicUsize,
    /// Set while a drain pass runs, so concurrent callers do not pile on.
    drain_in_progress: AtomicBool,
    capacity: usize,
}

impl DomainFreeQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            ring: SpinLock::new(Ring {
                slots: vec![Slot::default(); capacity],
                head: 0,
                tail: 0,
            }),
            num_elements: AtomicUsize::new(0),
            drain_in_progress: AtomicBool::new(false),
            capacity,
        }
    }

    /// Enqueues a pending free; `false` when the ring is full.
    pub fn enqueue(&self, addr: PhysAddr, pages: u64) -> bool {
        let ok = self.ring.with_lock(|r| {
            let next = (r.tail + 1) % self.capacity;
            if next == r.head {
                return false;
            }
            r.slots[r.tail] = Slot { addr, pages };
            r.tail = next;
            true
        });
        if ok {
            self.num_elements.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Dequeues one pending free.
    pub fn dequeue(&self) -> Option<(PhysAddr, u64)> {
        let out = self.ring.with_lock(|r| {
            if r.head == r.tail {
                return None;
            }
            let s = r.slots[r.head];
            r.head = (r.head + 1) % self.capacity;
            Some((s.addr, s.pages))
        });
        if out.is_some() {
            self.num_elements.fetch_sub(1, Ordering::Relaxed);
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num_elements.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the drain flag; the matching [`end_drain`](Self::end_drain)
    /// must follow. Returns `false` when another drain is already running.
    pub fn begin_drain(&self) -> bool {
        !self.drain_in_progress.swap(true, Ordering::Acquire)
    }

    pub fn end_drain(&self) {
        self.drain_in_progress.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_pairs() {
        let q = DomainFreeQueue::new(4);
        assert!(q.enqueue(0x1000, 1));
        assert!(q.enqueue(0x2000, 4));
        assert_eq!(q.dequeue(), Some((0x1000, 1)));
        assert_eq!(q.dequeue(), Some((0x2000, 4)));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn full_ring_rejects() {
        let q = DomainFreeQueue::new(3);
        assert!(q.enqueue(1, 1));
        assert!(q.enqueue(2, 1));
        assert!(!q.enqueue(3, 1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drain_flag_is_exclusive() {
        let q = DomainFreeQueue::new(4);
        assert!(q.begin_drain());
        assert!(!q.begin_drain());
        q.end_drain();
        assert!(q.begin_drain());
        q.end_drain();
    }
}
