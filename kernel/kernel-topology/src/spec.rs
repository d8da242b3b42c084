use alloc::vec;
use alloc::vec::Vec;
use kernel_cpumask::CpuId;

/// Boot-time description of the machine, normally derived from firmware
/// tables. Tests construct these directly.
#[derive(Clone, Debug)]
pub struct TopologySpec {
    /// CPU ids per NUMA node. Every CPU appears in exactly one node.
    pub numa_nodes: Vec<Vec<CpuId>>,
    /// NUMA relative distances; `distances[a][b]`, zero diagonal.
    pub distances: Vec<Vec<u8>>,
}

impl TopologySpec {
    /// A machine without NUMA: one node at distance zero holding every CPU.
    #[must_use]
    pub fn uniform(cpus: usize) -> Self {
        Self {
            numa_nodes: vec![(0..cpus).collect()],
            distances: vec![vec![0]],
        }
    }

    /// A NUMA machine from explicit node membership and distances.
    ///
    /// # Panics
    /// Panics if the distance matrix is not square with the node count, or
    /// if the diagonal is not zero.
    #[must_use]
    pub fn numa(numa_nodes: Vec<Vec<CpuId>>, distances: Vec<Vec<u8>>) -> Self {
        assert_eq!(numa_nodes.len(), distances.len());
        for (i, row) in distances.iter().enumerate() {
            assert_eq!(row.len(), numa_nodes.len());
            assert_eq!(row[i], 0, "distance to self must be 0");
        }
        Self { numa_nodes, distances }
    }

    /// Total number of CPUs described.
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.numa_nodes.iter().map(Vec::len).sum()
    }
}
