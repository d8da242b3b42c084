use crate::work::OneshotWork;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::SpinLock;

struct Slot {
    seq: AtomicU64,
    work: SpinLock<Option<OneshotWork>>,
}

/// Bounded MPMC ring of one-shot works.
///
/// Slot reservation is lockless via per-slot sequence numbers; an enqueue
/// CASes the head to claim a slot, writes the payload, then publishes by
/// storing `seq = pos + 1`. A dequeue that observes the published sequence
/// reads exactly the matching payload. `head - tail` never exceeds the
/// capacity.
pub struct WorkRing {
    slots: Vec<Slot>,
    head: AtomicU64,
    tail: AtomicU64,
    capacity: u64,
}

impl WorkRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            slots: (0..capacity)
                .map(|i| Slot {
                    seq: AtomicU64::new(i as u64),
                    work: SpinLock::new(None),
                })
                .collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity: capacity as u64,
        }
    }

    /// Publishes one work; `false` when the ring is full.
    pub fn enqueue(&self, work: OneshotWork) -> bool {
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
                    *slot.work.lock() = Some(work);
                    slot.seq.store(pos + 1, Ordering::Release);
                    return true;
                }
            } else if diff < 0 {
                return false;
            }
        }
    }

    /// Takes the oldest published work.
    pub fn dequeue(&self) -> Option<OneshotWork> {
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
                    let work = slot.work.lock().take();
                    slot.seq.store(pos + self.capacity, Ordering::Release);
                    return work;
                }
            } else if diff < 0 {
                return None;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.saturating_sub(tail)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkArgs;
    use core::sync::atomic::AtomicUsize;

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn bump(a: usize, _b: usize) {
        HITS.fetch_add(a, Ordering::Relaxed);
    }

    #[test]
    fn fifo_publish_consume() {
        let r = WorkRing::new(4);
        assert!(r.enqueue(OneshotWork { func: bump, args: WorkArgs::new(1, 0) }));
        assert!(r.enqueue(OneshotWork { func: bump, args: WorkArgs::new(2, 0) }));
        assert_eq!(r.dequeue().unwrap().args.arg1, 1);
        assert_eq!(r.dequeue().unwrap().args.arg1, 2);
        assert!(r.dequeue().is_none());
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let r = WorkRing::new(4);
        for round in 0..3 {
            for i in 0..6 {
                let _ = r.enqueue(OneshotWork {
                    func: bump,
                    args: WorkArgs::new(round * 10 + i, 0),
                });
                assert!(r.len() <= r.capacity());
            }
            while r.dequeue().is_some() {}
        }
    }

    #[test]
    fn concurrent_traffic_observes_every_publish() {
        let r = std::sync::Arc::new(WorkRing::new(32));
        let consumed = std::sync::Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let r = std::sync::Arc::clone(&r);
            handles.push(std::thread::spawn(move || {
                let mut sent = 0usize;
                for i in 0..1000 {
                    if r.enqueue(OneshotWork { func: bump, args: WorkArgs::new(i, 0) }) {
                        sent += 1;
                    }
                }
                sent
            }));
        }
        for _ in 0..2 {
            let r = std::sync::Arc::clone(&r);
            let consumed = std::sync::Arc::clone(&consumed);
            handles.push(std::thread::spawn(move || {
                let mut got = 0usize;
                for _ in 0..4000 {
                    if r.dequeue().is_some() {
                        got += 1;
                    }
                }
                consumed.fetch_add(got, Ordering::Relaxed);
                0
            }));
        }

        let sent: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let mut total = consumed.load(Ordering::Relaxed);
        while r.dequeue().is_some() {
            total += 1;
        }
        assert_eq!(sent, total);
    }
}
