use crate::meta::{SlabMeta, SlabState};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_time::TimeMs;
use kernel_vas::VirtAddr;

/// The three per-class slab lists.
#[derive(Debug, Default)]
pub struct CacheLists {
    pub free: Vec<VirtAddr>,
    pub partial: Vec<VirtAddr>,
    pub full: Vec<VirtAddr>,
}

impl CacheLists {
    fn list_mut(&mut self, state: SlabState) -> &mut Vec<VirtAddr> {
        match state {
            SlabState::Free => &mut self.free,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
            SlabState::InGcList => unreachable!("GC slabs are not on cache lists"),
        }
    }

    fn remove(&mut self, state: SlabState, vpage: VirtAddr) {
        let list = self.list_mut(state);
        let pos = list
            .iter()
            .position(|v| *v == vpage)
            .unwrap_or_else(|| panic!("slab {vpage:#x} missing from its {state:?} list"));
        list.swap_remove(pos);
    }

    /// Number of slabs with room (free + partial).
    #[must_use]
    pub fn usable(&self) -> usize {
        self.free.len() + self.partial.len()
    }
}

/// Everything one domain's slab layer owns, under a single lock: the slab
/// registry, the cache lists for both pageability groups, and the GC tree
/// keyed by enqueue time.
#[derive(Debug, Default)]
pub struct DomainSlabs {
    pub slabs: BTreeMap<VirtAddr, SlabMeta>,
    /// `[pageable as usize][class]`.
    pub caches: [[CacheLists; crate::SLAB_CLASS_COUNT]; 2],
    pub gc: BTreeMap<(TimeMs, VirtAddr), ()>,
}

impl DomainSlabs {
    pub fn lists_mut(&mut self, pageable: bool, class: usize) -> &mut CacheLists {
        &mut self.caches[usize::from(pageable)][class]
    }

    #[must_use]
    pub fn lists(&self, pageable: bool, class: usize) -> &CacheLists {
        &self.caches[usize::from(pageable)][class]
    }

    /// Registers a brand-new slab on its free list.
    pub fn insert_slab(&mut self, meta: SlabMeta) {
        let vpage = meta.vpage;
        let (pageable, class) = (meta.pageable, meta.class);
        let prev = self.slabs.insert(vpage, meta);
        assert!(prev.is_none(), "slab {vpage:#x} registered twice");
        self.lists_mut(pageable, class).free.push(vpage);
    }

    /// Moves a slab between cache lists, keeping `state` coherent.
    pub fn move_slab(&mut self, vpage: VirtAddr, to: SlabState) {
        let (from, pageable, class) = {
            let meta = &self.slabs[&vpage];
            (meta.state, meta.pageable, meta.class)
        };
        if from == to {
            return;
        }
        let lists = self.lists_mut(pageable, class);
        if from != SlabState::InGcList {
            lists.remove(from, vpage);
        }
        if to != SlabState::InGcList {
            lists.list_mut(to).push(vpage);
        }
        self.slabs.get_mut(&vpage).unwrap().state = to;
    }

    /// Detaches a slab from the registry entirely (destruction path).
    pub fn remove_slab(&mut self, vpage: VirtAddr) -> SlabMeta {
        let meta = self.slabs.remove(&vpage).expect("slab not registered");
        if meta.state != SlabState::InGcList {
            let (pageable, class, state) = (meta.pageable, meta.class, meta.state);
            self.lists_mut(pageable, class).remove(state, vpage);
        }
        meta
    }

    /// Picks a slab with room from the partial list, then the free list.
    #[must_use]
    pub fn pick_usable(&self, pageable: bool, class: usize) -> Option<VirtAddr> {
        let lists = self.lists(pageable, class);
        lists.partial.first().or_else(|| lists.free.first()).copied()
    }

    /// Parks an empty slab on the GC tree.
    pub fn gc_enqueue(&mut self, vpage: VirtAddr, now: TimeMs) {
        self.move_slab(vpage, SlabState::InGcList);
        let meta = self.slabs.get_mut(&vpage).unwrap();
        meta.gc_enqueue_ms = now;
        self.gc.insert((now, vpage), ());
    }

    /// Takes the newest GC slab matching `pageable`, if any.
    pub fn gc_take_newest(&mut self, pageable: bool) -> Option<VirtAddr> {
        let key = self
            .gc
            .iter()
            .rev()
            .map(|(k, ())| *k)
            .find(|(_, vpage)| self.slabs[vpage].pageable == pageable)?;
        self.gc.remove(&key);
        Some(key.1)
    }

    #[must_use]
    pub fn gc_len(&self) -> usize {
        self.gc.len()
    }

    /// Total free slabs across every class of one pageability group.
    #[must_use]
    pub fn total_free_slabs(&self, pageable: bool) -> usize {
        (0..crate::SLAB_CLASS_COUNT)
            .map(|c| self.lists(pageable, c).free.len())
            .sum()
    }
}
