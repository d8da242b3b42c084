use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::SpinLock;
use kernel_vas::{HeapStore, VirtAddr};

struct Slot {
    seq: AtomicU64,
    addr: AtomicU64,
}

#[derive(Default)]
struct OverflowList {
    head: VirtAddr,
    tail: VirtAddr,
}

/// Per-domain queue of pending object frees.
///
/// Two tiers: a lockless MPMC ring with per-slot sequence numbers for the
/// common case, and an overflow singly-linked list threaded through the
/// freed memory itself when the ring fills. The minimum object size is a
/// pointer, so every queued address is guaranteed to hold the link word.
pub struct SlabFreeQueue {
    slots: Vec<Slot>,
    head: AtomicU64,
    tail: AtomicU64,
    capacity: u64,
    list: SpinLock<OverflowList>,
    store: Arc<HeapStore>,
}

impl SlabFreeQueue {
    #[must_use]
    pub fn new(capacity: usize, store: Arc<HeapStore>) -> Self {
        let capacity = capacity.max(2);
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                addr: AtomicU64::new(0),
            })
            .collect();
        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity: capacity as u64,
            list: SpinLock::new(OverflowList::default()),
            store,
        }
    }

    /// Enqueues onto the ring; `false` when the ring is full.
    pub fn ring_enqueue(&self, addr: VirtAddr) -> bool {
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let slot = &self.slots[(pos % self.capacity) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;

            if diff == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.addr.store(addr, Ordering::Relaxed);
                    slot.seq.store(pos + 1, Ordering::Release);
                    return true;
                }
            } else if diff < 0 {
                return false;
            }
        }
    }

    /// Dequeues from the ring; `None` when empty.
    pub fn ring_dequeue(&self) -> Option<VirtAddr> {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let slot = &self.slots[(pos % self.capacity) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - (pos + 1) as i64;

            if diff == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let addr = slot.addr.load(Ordering::Relaxed);
                    slot.seq.store(pos + self.capacity, Ordering::Release);
                    return Some(addr);
                }
            } else if diff < 0 {
                return None;
            }
        }
    }

    /// Appends to the overflow list, writing the link word into the freed
    /// object's first bytes.
    pub fn list_enqueue(&self, addr: VirtAddr) {
        self.store.write_u64(addr, 0);
        self.list.with_lock(|l| {
            if l.head == 0 {
                l.head = addr;
                l.tail = addr;
            } else {
                self.store.write_u64(l.tail, addr);
                l.tail = addr;
            }
        });
    }

    /// Pops from the overflow list.
    pub fn list_dequeue(&self) -> Option<VirtAddr> {
        self.list.with_lock(|l| {
            if l.head == 0 {
                return None;
            }
            let addr = l.head;
            l.head = self.store.read_u64(addr);
            if l.head == 0 {
                l.tail = 0;
            }
            Some(addr)
        })
    }

    /// Pops one pending free from either tier, ring first.
    pub fn dequeue(&self) -> Option<VirtAddr> {
        self.ring_dequeue().or_else(|| self.list_dequeue())
    }

    /// Entries currently in the ring (the overflow list is uncounted).
    #[must_use]
    pub fn ring_len(&self) -> u64 {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.saturating_sub(tail)
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(cap: usize) -> SlabFreeQueue {
        let store = Arc::new(HeapStore::new(0x10_000, 0x10_000));
        SlabFreeQueue::new(cap, store)
    }

    #[test]
    fn ring_fifo() {
        let q = queue(4);
        assert!(q.ring_enqueue(0x10_000));
        assert!(q.ring_enqueue(0x10_100));
        assert_eq!(q.ring_dequeue(), Some(0x10_000));
        assert_eq!(q.ring_dequeue(), Some(0x10_100));
        assert_eq!(q.ring_dequeue(), None);
    }

    #[test]
    fn ring_full_rejects_and_recovers() {
        let q = queue(2);
        assert!(q.ring_enqueue(0x10_000));
        assert!(q.ring_enqueue(0x10_010));
        assert!(!q.ring_enqueue(0x10_020));
        assert_eq!(q.ring_dequeue(), Some(0x10_000));
        assert!(q.ring_enqueue(0x10_020));
    }

    #[test]
    fn ring_occupancy_never_exceeds_capacity() {
        let q = queue(8);
        for round in 0..5u64 {
            for i in 0..8 {
                let _ = q.ring_enqueue(0x10_000 + round * 64 + i * 8);
            }
            assert!(q.ring_len() <= q.capacity());
            while q.ring_dequeue().is_some() {}
        }
    }

    #[test]
    fn overflow_list_threads_through_memory() {
        let q = queue(2);
        q.list_enqueue(0x10_000);
        q.list_enqueue(0x10_040);
        q.list_enqueue(0x10_080);

        // The link of the first object points at the second.
        assert_eq!(q.dequeue(), Some(0x10_000));
        assert_eq!(q.dequeue(), Some(0x10_040));
        assert_eq!(q.dequeue(), Some(0x10_080));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn dequeue_prefers_ring_over_list() {
        let q = queue(4);
        q.list_enqueue(0x10_100);
        q.ring_enqueue(0x10_000);
        assert_eq!(q.dequeue(), Some(0x10_000));
        assert_eq!(q.dequeue(), Some(0x10_100));
    }

    #[test]
    fn concurrent_ring_traffic_is_lossless() {
        use std::sync::atomic::AtomicU64 as StdAtomic;
        let q = std::sync::Arc::new(queue(64));
        let popped = std::sync::Arc::new(StdAtomic::new(0));
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let q = std::sync::Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut pushed = 0u64;
                for i in 0..1000u64 {
                    if q.ring_enqueue(0x10_000 + t * 0x1000 + i * 8) {
                        pushed += 1;
                    }
                }
                pushed
            }));
        }
        for _ in 0..2 {
            let q = std::sync::Arc::clone(&q);
            let popped = std::sync::Arc::clone(&popped);
            handles.push(std::thread::spawn(move || {
                let mut n = 0u64;
                for _ in 0..4000 {
                    if q.ring_dequeue().is_some() {
                        n += 1;
                    }
                }
                popped.fetch_add(n, Ordering::Relaxed);
                0
            }));
        }

        let pushed: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let mut drained = popped.load(Ordering::Relaxed);
        while q.ring_dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(pushed, drained, "every publish observed exactly once");
    }
}
