use std::sync::Arc;

use kernel_buddy::BuddyZone;
use kernel_domain::{AllocBehavior, AllocFlags, DomainSet};
use kernel_slab::{GcAggressiveness, GcRequest, SlabAllocator, SlabConfig, class_size};
use kernel_time::ManualClock;
use kernel_topology::{Topology, TopologySpec};

fn fixture(nodes: Vec<Vec<usize>>, dists: Vec<Vec<u8>>, pages_per_node: u64) -> (SlabAllocator, Arc<ManualClock>) {
    let topo = Arc::new(Topology::build(&TopologySpec::numa(nodes, dists)));
    let zones = (0..topo.numa_count())
        .map(|d| BuddyZone::with_free_range(d, d as u64 * pages_per_node, pages_per_node))
        .collect();
    let set = Arc::new(DomainSet::new(topo, zones));
    let clock = Arc::new(ManualClock::new());
    let slab = SlabAllocator::new(set, clock.clone(), &SlabConfig::default());
    (slab, clock)
}

fn single_node() -> (SlabAllocator, Arc<ManualClock>) {
    let topo = Arc::new(Topology::build(&TopologySpec::uniform(2)));
    let zones = vec![BuddyZone::with_free_range(0, 0, 2048)];
    let set = Arc::new(DomainSet::new(topo, zones));
    let clock = Arc::new(ManualClock::new());
    let slab = SlabAllocator::new(set, clock.clone(), &SlabConfig::default());
    (slab, clock)
}

#[test]
fn roundtrip_and_ksize() {
    let (slab, _) = single_node();
    let a = slab
        .kmalloc(0, 40, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    assert_eq!(slab.ksize(a), 64, "40 bytes rounds to the 64-byte class");
    slab.kfree(0, a, AllocBehavior::MayFault);
    assert!(slab.check_all());
}

#[test]
fn distinct_objects_until_slab_fills() {
    let (slab, _) = single_node();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..500 {
        let p = slab
            .kmalloc(0, 128, AllocFlags::default(), AllocBehavior::MayFault)
            .unwrap();
        assert!(seen.insert(p), "object {p:#x} handed out twice");
    }
    assert!(slab.check_all());
}

#[test]
fn magazine_serves_repeat_traffic() {
    let (slab, _) = single_node();
    let a = slab
        .kmalloc(0, 64, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    slab.kfree(0, a, AllocBehavior::MayFault);

    // The slowpath refilled the magazines; repeat traffic now hits them.
    let b = slab
        .kmalloc(0, 64, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    assert!(
        slab.stats_of(0)
            .magazine_hits
            .load(std::sync::atomic::Ordering::Relaxed)
            > 0
    );
    slab.kfree(0, b, AllocBehavior::MayFault);
    assert!(slab.check_all());
}

#[test]
fn large_allocations_carry_page_headers() {
    let (slab, _) = single_node();
    let a = slab
        .kmalloc(0, 8192, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    assert!(slab.ksize(a) >= 8192);
    slab.kfree(0, a, AllocBehavior::MayFault);
    // Draining resolves the queued page run back to the buddy.
    slab.drain_free_queue_fully(0, 0);
    assert!(slab.check_all());
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let (slab, _) = single_node();
    let a = slab
        .kmalloc(0, 16, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();

    // Push each free past the magazine and queue so it reaches the bitmap.
    slab.kfree(0, a, AllocBehavior::MayFault);
    slab.flush_cpu_magazines(0);
    slab.drain_free_queue_fully(0, 0);

    slab.kfree(0, a, AllocBehavior::MayFault);
    slab.flush_cpu_magazines(0);
    slab.drain_free_queue_fully(0, 0);
}

#[test]
fn realloc_moves_between_classes() {
    let (slab, _) = single_node();
    let a = slab
        .kmalloc(0, 48, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    assert_eq!(slab.ksize(a), 64);

    let b = slab
        .krealloc(0, a, 300, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    assert_eq!(slab.ksize(b), 512);

    // Shrinking to zero frees.
    assert!(
        slab.krealloc(0, b, 0, AllocFlags::default(), AllocBehavior::MayFault)
            .is_none()
    );
    assert!(slab.check_all());
}

#[test]
fn zeroing_allocates_cleared_memory() {
    let (slab, _) = single_node();
    let a = slab
        .kzalloc(0, 256, AllocFlags::default(), AllocBehavior::MayFault)
        .unwrap();
    assert_eq!(slab.ksize(a), 256);
    slab.kfree(0, a, AllocBehavior::MayFault);
}

/// Cross-domain free traffic: allocate on CPU 0 (node 0), free everything
/// from CPU 1 (node 1). The owner's free queue and magazines both absorb
/// some of it, and a drain cycle leaves the queue empty with the slabs
/// free or parked for GC.
#[test]
fn remote_free_traffic_spreads_then_drains() {
    let (slab, _) = fixture(
        vec![vec![0], vec![1]],
        vec![vec![0, 2], vec![2, 0]],
        4096,
    );

    let mut ptrs = Vec::with_capacity(1000);
    for _ in 0..1000 {
        ptrs.push(
            slab.kmalloc(0, 64, AllocFlags::default(), AllocBehavior::MayFault)
                .unwrap(),
        );
    }

    // Start from empty magazines so the remote frees land observably.
    slab.flush_cpu_magazines(0);
    slab.drain_free_queue_fully(0, 0);

    for p in &ptrs {
        slab.kfree(1, *p, AllocBehavior::MayFault);
    }

    let class = kernel_slab::size_to_class(64).unwrap();
    let mag_frees = slab
        .stats_of(0)
        .frees_to_magazine
        .load(std::sync::atomic::Ordering::Relaxed);
    let ring_frees = slab
        .stats_of(0)
        .frees_to_ring
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(mag_frees > 0, "owner magazines absorbed none");
    assert!(ring_frees > 0, "owner free queue absorbed none");
    assert!(slab.magazine_len(0, class) > 0);

    // Drain cycle: flush magazines, then empty the queue.
    slab.flush_cpu_magazines(0);
    slab.flush_cpu_magazines(1);
    slab.drain_free_queue_fully(0, 0);
    slab.drain_free_queue_fully(1, 1);

    assert_eq!(slab.free_queue_ring_len(0), 0);
    assert_eq!(slab.free_queue_ring_len(1), 0);
    assert!(slab.check_all(), "bitmap/used/state coherence after drain");
    assert!(slab.gc_list_len(0) > 0, "empty slabs parked for GC");
}

#[test]
fn gc_pass_reclaims_parked_slabs() {
    let (slab, clock) = single_node();

    // Build up several completely-free slabs of one class.
    let mut ptrs = Vec::new();
    for _ in 0..600 {
        ptrs.push(
            slab.kmalloc(0, class_size(3), AllocFlags::default(), AllocBehavior::MayFault)
                .unwrap(),
        );
    }
    for p in ptrs {
        slab.kfree(0, p, AllocBehavior::MayFault);
    }
    slab.flush_cpu_magazines(0);
    slab.drain_free_queue_fully(0, 0);

    let parked = slab.gc_list_len(0);
    assert!(parked > 0);

    // Age the parked slabs, then collect aggressively.
    clock.advance(10_000);
    let outcome = slab.gc_run(
        0,
        0,
        &GcRequest {
            aggressiveness: GcAggressiveness::Emergency,
            destroy_bias: 8,
            ..GcRequest::default()
        },
    );
    assert!(outcome.examined > 0);
    assert!(outcome.recycled + outcome.destroyed > 0);
    assert!(slab.gc_list_len(0) < parked);
    assert!(slab.check_all());
}

#[test]
fn exhaustion_returns_none_after_emergency_gc() {
    // A tiny domain: 32 pages minus bookkeeping.
    let topo = Arc::new(Topology::build(&TopologySpec::uniform(1)));
    let zones = vec![BuddyZone::with_free_range(0, 0, 32)];
    let set = Arc::new(DomainSet::new(topo, zones));
    let clock = Arc::new(ManualClock::new());
    let slab = SlabAllocator::new(set, clock, &SlabConfig::default());

    let mut got = 0u64;
    loop {
        if slab
            .kmalloc(0, 1024, AllocFlags::default(), AllocBehavior::MayFault)
            .is_none()
        {
            break;
        }
        got += 1;
        assert!(got < 10_000, "tiny domain cannot satisfy this many");
    }
    assert!(got > 0);
    assert!(
        slab.stats_of(0)
            .failures
            .load(std::sync::atomic::Ordering::Relaxed)
            > 0
    );
}
