use alloc::vec::Vec;
use kernel_topology::{NumaId, Topology};

/// One candidate domain in another domain's ordered view of the machine.
#[derive(Clone, Copy, Debug)]
pub struct ZonelistEntry {
    pub domain: NumaId,
    /// Relative NUMA distance; 0 means self.
    pub distance: u8,
}

/// A domain's ordered list of all domains, nearest first.
///
/// Built once at boot: sorted by distance, then by the free-page count the
/// domains reported at build time, ties broken by domain id. A machine
/// without NUMA gets a single self entry at distance 0.
#[derive(Clone, Debug)]
pub struct Zonelist {
    pub entries: Vec<ZonelistEntry>,
}

impl Zonelist {
    #[must_use]
    pub fn build(topology: &Topology, own: NumaId, free_pages_of: &[u64]) -> Self {
        let mut entries: Vec<ZonelistEntry> = (0..topology.numa_count())
            .map(|domain| ZonelistEntry {
                domain,
                distance: topology.distance(own, domain),
            })
            .collect();

        entries.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then(free_pages_of[b.domain].cmp(&free_pages_of[a.domain]))
                .then(a.domain.cmp(&b.domain))
        });

        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_topology::TopologySpec;

    #[test]
    fn self_comes_first() {
        let t = Topology::build(&TopologySpec::numa(
            vec![vec![0], vec![1], vec![2]],
            vec![vec![0, 1, 2], vec![1, 0, 1], vec![2, 1, 0]],
        ));
        let zl = Zonelist::build(&t, 2, &[100, 100, 100]);
        assert_eq!(zl.entries[0].domain, 2);
        assert_eq!(zl.entries[0].distance, 0);
        assert_eq!(zl.entries[1].domain, 1);
        assert_eq!(zl.entries[2].domain, 0);
    }

    #[test]
    fn equal_distance_prefers_more_free_pages() {
        let t = Topology::build(&TopologySpec::numa(
            vec![vec![0], vec![1], vec![2]],
            vec![vec![0, 1, 1], vec![1, 0, 1], vec![1, 1, 0]],
        ));
        let zl = Zonelist::build(&t, 0, &[10, 5, 50]);
        assert_eq!(zl.entries[0].domain, 0);
        assert_eq!(zl.entries[1].domain, 2, "more free pages wins the tie");
        assert_eq!(zl.entries[2].domain, 1);
    }
}
