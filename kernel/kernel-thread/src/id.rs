use alloc::collections::BTreeSet;
use kernel_sync::SpinLock;

/// Tree-based thread id space: released ids are reused lowest-first.
pub struct IdAllocator {
    inner: SpinLock<IdInner>,
}

struct IdInner {
    next: u64,
    released: BTreeSet<u64>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(IdInner {
                next: 1,
                released: BTreeSet::new(),
            }),
        }
    }

    pub fn alloc(&self) -> u64 {
        self.inner.with_lock(|i| {
            if let Some(id) = i.released.pop_first() {
                return id;
            }
            let id = i.next;
            i.next += 1;
            id
        })
    }

    pub fn release(&self, id: u64) {
        self.inner.with_lock(|i| {
            let fresh = i.released.insert(id);
            assert!(fresh && id < i.next, "release of unallocated id {id}");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_reused() {
        let ids = IdAllocator::new();
        let a = ids.alloc();
        let b = ids.alloc();
        assert_ne!(a, b);
        ids.release(a);
        assert_eq!(ids.alloc(), a, "released id comes back first");
    }

    #[test]
    #[should_panic(expected = "unallocated id")]
    fn double_release_panics() {
        let ids = IdAllocator::new();
        let a = ids.alloc();
        ids.release(a);
        ids.release(a);
    }
}
