use std::sync::Arc;

use kernel_buddy::BuddyZone;
use kernel_domain::{AllocFlags, AllocOpts, DomainSet, LOCALITY_MIN};
use kernel_topology::{Topology, TopologySpec};

fn two_node_set() -> DomainSet {
    // CPUs 0,1 on node 0; CPUs 2,3 on node 1; distance 2 between them.
    let topo = Arc::new(Topology::build(&TopologySpec::numa(
        vec![vec![0, 1], vec![2, 3]],
        vec![vec![0, 2], vec![2, 0]],
    )));
    let zones = vec![
        BuddyZone::with_free_range(0, 0, 1024),
        BuddyZone::with_free_range(1, 1024, 1024),
    ];
    DomainSet::new(topo, zones)
}

#[test]
fn local_free_feeds_local_arena_then_alloc_reuses_it() {
    let set = two_node_set();

    let a = set.alloc_pages(0, 1, AllocFlags::default()).unwrap();
    set.free_pages(0, a, 1);

    // The page went to CPU 0's arena, not back through the buddy.
    let local = set.domain_of_cpu(0);
    let idx = local.arena_index_of(0).unwrap();
    assert_eq!(local.arena_len(idx), 1);

    let b = set.alloc_pages(0, 1, AllocFlags::default()).unwrap();
    assert_eq!(a, b, "arena pop returns the cached page");
}

#[test]
fn remote_free_lands_on_owner_free_queue() {
    let set = two_node_set();

    let a = set.alloc_pages(0, 1, AllocFlags::default()).unwrap();
    // CPU 2 lives on node 1; freeing node-0 memory from it is remote.
    set.free_pages(2, a, 1);

    let owner = set.domain_for_addr(a);
    assert_eq!(owner.id(), 0);
    assert_eq!(owner.free_queue_len(), 1);

    set.flush_free_queue(0);
    assert_eq!(owner.free_queue_len(), 0, "flush drains the pending free");
}

#[test]
fn multi_page_allocations_bypass_arenas() {
    let set = two_node_set();

    let a = set.alloc_pages(0, 8, AllocFlags::default()).unwrap();
    set.free_pages(0, a, 8);

    let local = set.domain_of_cpu(0);
    let idx = local.arena_index_of(0).unwrap();
    assert_eq!(local.arena_len(idx), 0, "arenas only cache single pages");
    assert_eq!(local.free_pages(), 1024);
}

#[test]
fn interleaved_allocations_rotate_domains() {
    let set = two_node_set();
    let flags = AllocFlags::new(AllocOpts::CLASS_INTERLEAVED);

    let a = set.alloc_pages(0, 1, flags).unwrap();
    let b = set.alloc_pages(0, 1, flags).unwrap();

    let da = set.domain_for_addr(a).id();
    let db = set.domain_for_addr(b).id();
    assert_ne!(da, db, "consecutive interleaved allocs hit different domains");

    let local = set.domain_of_cpu(0);
    assert_eq!(
        local
            .stats()
            .interleaved_alloc_count
            .load(std::sync::atomic::Ordering::Relaxed),
        2
    );
}

#[test]
fn loose_locality_spills_to_remote_when_local_exhausted() {
    let topo = Arc::new(Topology::build(&TopologySpec::numa(
        vec![vec![0], vec![1]],
        vec![vec![0, 1], vec![1, 0]],
    )));
    // Node 0 is tiny; node 1 is large.
    let zones = vec![
        BuddyZone::with_free_range(0, 0, 4),
        BuddyZone::with_free_range(1, 4, 1024),
    ];
    let set = DomainSet::new(topo, zones);

    let flags = AllocFlags::default().with_locality(LOCALITY_MIN);
    // Ask for more than node 0 can hold.
    let addr = set.alloc_pages(0, 16, flags).unwrap();
    assert_eq!(set.domain_for_addr(addr).id(), 1);
    assert!(
        set.domain_of_cpu(0)
            .stats()
            .remote_alloc_count
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}

#[test]
fn strict_locality_fails_rather_than_spilling() {
    let topo = Arc::new(Topology::build(&TopologySpec::numa(
        vec![vec![0], vec![1]],
        vec![vec![0, 1], vec![1, 0]],
    )));
    let zones = vec![
        BuddyZone::with_free_range(0, 0, 4),
        BuddyZone::with_free_range(1, 4, 1024),
    ];
    let set = DomainSet::new(topo, zones);

    // Strict-local 16-page request cannot be satisfied by a 4-page domain.
    assert!(set.alloc_pages(0, 16, AllocFlags::default()).is_none());
    assert!(
        set.domain_of_cpu(0)
            .stats()
            .failed_alloc_count
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}

#[test]
fn free_queue_drain_feeds_allocation_fastpath() {
    let set = two_node_set();

    // Pile remote frees onto node 0's queue.
    let mut held = Vec::new();
    for _ in 0..8 {
        held.push(set.alloc_pages(0, 1, AllocFlags::default()).unwrap());
    }
    for a in held {
        set.free_pages(2, a, 1);
    }

    let owner = set.domain(0);
    assert!(owner.free_queue_len() > 0);

    // A local single-page alloc may drain a quota of the queue on its way.
    let _ = set.alloc_pages(0, 1, AllocFlags::default()).unwrap();
    assert_eq!(owner.free_pages(), 1023, "exactly one page outstanding");
}
