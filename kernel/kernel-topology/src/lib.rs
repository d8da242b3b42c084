//! # CPU topology
//!
//! Enumerates the machine as a tree of levels — machine, package, last-level
//! cache, NUMA node, core, SMT sibling — and tracks which CPUs are idle at
//! every level. The scheduler consults the idle masks for push balancing,
//! and the memory allocator derives its zonelists from the NUMA distance
//! matrix kept here.
//!
//! The tree is built once at boot from a [`TopologySpec`] and is immutable
//! afterwards except for the idle masks.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod spec;

pub use spec::TopologySpec;

use alloc::vec;
use alloc::vec::Vec;
use kernel_cpumask::{CpuId, CpuMask};
use kernel_sync::SpinLock;

/// Identifier of a NUMA node.
pub type NumaId = usize;

/// Hierarchy levels, innermost first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TopoLevel {
    Smt,
    Core,
    Llc,
    Numa,
    Package,
    Machine,
}

impl TopoLevel {
    pub const COUNT: usize = 6;

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Smt => 0,
            Self::Core => 1,
            Self::Llc => 2,
            Self::Numa => 3,
            Self::Package => 4,
            Self::Machine => 5,
        }
    }
}

/// One node of the topology tree: a set of CPUs at some level.
#[derive(Debug)]
pub struct TopoNode {
    pub level: TopoLevel,
    pub id: usize,
    pub cpus: CpuMask,
}

/// The boot-discovered machine topology.
#[derive(Debug)]
pub struct Topology {
    cpu_count: usize,
    /// Nodes per level, indexed by [`TopoLevel::index`].
    nodes: [Vec<TopoNode>; TopoLevel::COUNT],
    /// NUMA node owning each CPU.
    cpu_numa: Vec<NumaId>,
    /// Relative distance matrix, `dist[a][b]`; 0 on the diagonal.
    distances: Vec<Vec<u8>>,
    /// CPUs currently idle, updated by the schedulers.
    idle: SpinLock<CpuMask>,
}

impl Topology {
    /// Builds the tree from a boot-time description.
    #[must_use]
    pub fn build(spec: &TopologySpec) -> Self {
        let n = spec.cpu_count();
        let numa_count = spec.numa_nodes.len();

        let mut cpu_numa = vec![0; n];
        let mut numa_nodes = Vec::with_capacity(numa_count);
        for (id, cpus) in spec.numa_nodes.iter().enumerate() {
            let mut mask = CpuMask::new(n);
            for &cpu in cpus {
                mask.set(cpu);
                cpu_numa[cpu] = id;
            }
            numa_nodes.push(TopoNode {
                level: TopoLevel::Numa,
                id,
                cpus: mask,
            });
        }

        // Single-package, per-CPU cores and SMT siblings; the finer levels
        // collapse onto the core when the spec does not refine them.
        let per_cpu = |level: TopoLevel| -> Vec<TopoNode> {
            (0..n)
                .map(|cpu| {
                    let mut m = CpuMask::new(n);
                    m.set(cpu);
                    TopoNode { level, id: cpu, cpus: m }
                })
                .collect()
        };

        let machine = vec![TopoNode {
            level: TopoLevel::Machine,
            id: 0,
            cpus: CpuMask::all(n),
        }];
        let package = vec![TopoNode {
            level: TopoLevel::Package,
            id: 0,
            cpus: CpuMask::all(n),
        }];

        // One LLC per NUMA node.
        let llc = spec
            .numa_nodes
            .iter()
            .enumerate()
            .map(|(id, cpus)| {
                let mut m = CpuMask::new(n);
                for &cpu in cpus {
                    m.set(cpu);
                }
                TopoNode { level: TopoLevel::Llc, id, cpus: m }
            })
            .collect();

        log::debug!("topology: {n} cpus across {numa_count} numa node(s)");

        Self {
            cpu_count: n,
            nodes: [
                per_cpu(TopoLevel::Smt),
                per_cpu(TopoLevel::Core),
                llc,
                numa_nodes,
                package,
                machine,
            ],
            cpu_numa,
            distances: spec.distances.clone(),
            idle: SpinLock::new(CpuMask::new(n)),
        }
    }

    #[must_use]
    pub const fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    #[must_use]
    pub fn numa_count(&self) -> usize {
        self.nodes[TopoLevel::Numa.index()].len()
    }

    /// NUMA node owning `cpu`.
    #[must_use]
    pub fn numa_of(&self, cpu: CpuId) -> NumaId {
        self.cpu_numa[cpu]
    }

    /// CPUs belonging to NUMA node `id`.
    #[must_use]
    pub fn numa_cpus(&self, id: NumaId) -> &CpuMask {
        &self.nodes[TopoLevel::Numa.index()][id].cpus
    }

    /// Relative distance between two NUMA nodes; 0 means self.
    #[must_use]
    pub fn distance(&self, a: NumaId, b: NumaId) -> u8 {
        self.distances[a][b]
    }

    /// Nodes at `level`.
    #[must_use]
    pub fn nodes_at(&self, level: TopoLevel) -> &[TopoNode] {
        &self.nodes[level.index()]
    }

    /// Marks `cpu` idle or busy in the machine-wide idle mask.
    pub fn set_cpu_idle(&self, cpu: CpuId, idle: bool) {
        self.idle.with_lock(|m| {
            if idle {
                m.set(cpu);
            } else {
                m.clear(cpu);
            }
        });
    }

    #[must_use]
    pub fn cpu_is_idle(&self, cpu: CpuId) -> bool {
        self.idle.with_lock(|m| m.test(cpu))
    }

    /// Snapshot of the idle CPU mask.
    #[must_use]
    pub fn idle_cpus(&self) -> CpuMask {
        self.idle.with_lock(|m| m.clone())
    }

    /// Whether `a` and `b` share a NUMA node. With a single node this is
    /// always true, which lets callers use it unconditionally.
    #[must_use]
    pub fn same_numa(&self, a: CpuId, b: CpuId) -> bool {
        self.cpu_numa[a] == self.cpu_numa[b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_single_node() {
        let t = Topology::build(&TopologySpec::uniform(4));
        assert_eq!(t.cpu_count(), 4);
        assert_eq!(t.numa_count(), 1);
        assert_eq!(t.numa_of(3), 0);
        assert_eq!(t.distance(0, 0), 0);
        assert!(t.same_numa(0, 3));
    }

    #[test]
    fn two_node_distances() {
        let spec = TopologySpec::numa(vec![vec![0, 1], vec![2, 3]], vec![vec![0, 2], vec![2, 0]]);
        let t = Topology::build(&spec);
        assert_eq!(t.numa_count(), 2);
        assert_eq!(t.numa_of(0), 0);
        assert_eq!(t.numa_of(2), 1);
        assert_eq!(t.distance(0, 1), 2);
        assert!(!t.same_numa(1, 2));
        assert_eq!(t.numa_cpus(1).count(), 2);
    }

    #[test]
    fn idle_mask_tracks_cpus() {
        let t = Topology::build(&TopologySpec::uniform(3));
        assert!(!t.cpu_is_idle(1));
        t.set_cpu_idle(1, true);
        assert!(t.cpu_is_idle(1));
        assert_eq!(t.idle_cpus().count(), 1);
        t.set_cpu_idle(1, false);
        assert!(t.idle_cpus().is_empty());
    }
}
