use kernel_buddy::{BuddyZone, MAX_ORDER};

/// An order-22 region must coalesce back to a single maximal block after a
/// burst of order-0 allocations is released in reverse order.
#[test]
fn max_order_region_recoalesces() {
    let pages = 1u64 << MAX_ORDER;
    let mut zone = BuddyZone::with_free_range(0, 0, pages);
    assert_eq!(zone.free_blocks_at(MAX_ORDER), 1);

    let mut held = Vec::with_capacity(1000);
    for _ in 0..1000 {
        held.push(zone.alloc_order(0).expect("zone cannot be exhausted here"));
    }
    assert_eq!(zone.free_page_count(), pages - 1000);

    for pfn in held.into_iter().rev() {
        zone.free_order(pfn, 0);
    }

    assert_eq!(zone.free_page_count(), pages);
    assert_eq!(zone.free_blocks_at(MAX_ORDER), 1);
    for order in 0..MAX_ORDER {
        assert_eq!(zone.free_blocks_at(order), 0, "stray block at order {order}");
    }
    assert!(zone.check_free_areas());
}
