use crate::{SLAB_CLASS_COUNT, SLAB_MAG_ENTRIES};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinLock;
use kernel_vas::VirtAddr;

/// Per-(CPU, class) bounded stack of object addresses.
///
/// The owning CPU pushes and pops at DISPATCH level; other CPUs may push
/// through [`try_push`](Self::try_push) (a trylock) or drain the whole
/// magazine while flushing. Only local non-pageable objects belong here.
pub struct Magazine {
    objs: SpinLock<Vec<VirtAddr>>,
    count: AtomicUsize,
}

impl Default for Magazine {
    fn default() -> Self {
        Self::new()
    }
}

impl Magazine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objs: SpinLock::new(Vec::with_capacity(SLAB_MAG_ENTRIES)),
            count: AtomicUsize::new(0),
        }
    }

    /// Pushes an object; `false` when the magazine is full.
    pub fn push(&self, obj: VirtAddr) -> bool {
        let ok = self.objs.with_lock(|v| {
            if v.len() >= SLAB_MAG_ENTRIES {
                return false;
            }
            v.push(obj);
            true
        });
        if ok {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Cross-CPU push: gives up instead of spinning on the owner.
    pub fn try_push(&self, obj: VirtAddr) -> bool {
        let Some(mut v) = self.objs.try_lock() else {
            return false;
        };
        if v.len() >= SLAB_MAG_ENTRIES {
            return false;
        }
        v.push(obj);
        drop(v);
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pops the most recently cached object.
    pub fn pop(&self) -> Option<VirtAddr> {
        let out = self.objs.with_lock(Vec::pop);
        if out.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        out
    }

    /// Empties the magazine, returning its contents.
    pub fn drain(&self) -> Vec<VirtAddr> {
        let out = self.objs.with_lock(core::mem::take);
        self.count.store(0, Ordering::Relaxed);
        out
    }

    /// Cheap occupancy read for the pageable watermark check.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One magazine per size class for one CPU.
pub struct PerCpuMags {
    pub mags: [Magazine; SLAB_CLASS_COUNT],
}

impl Default for PerCpuMags {
    fn default() -> Self {
        Self {
            mags: core::array::from_fn(|_| Magazine::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_order_and_capacity() {
        let m = Magazine::new();
        for i in 0..SLAB_MAG_ENTRIES as u64 {
            assert!(m.push(0x1000 + i * 16));
        }
        assert!(!m.push(0xdead), "full magazine rejects");
        assert_eq!(m.len(), SLAB_MAG_ENTRIES);
        assert_eq!(m.pop(), Some(0x1000 + (SLAB_MAG_ENTRIES as u64 - 1) * 16));
    }

    #[test]
    fn drain_empties() {
        let m = Magazine::new();
        m.push(1);
        m.push(2);
        let all = m.drain();
        assert_eq!(all, vec![1, 2]);
        assert!(m.is_empty());
    }
}
