use alloc::sync::Arc;
use kernel_slab::SlabConfig;
use kernel_time::{ClockRef, ManualClock};
use kernel_topology::TopologySpec;
use kernel_vas::VirtAddr;

/// Boot parameters of the kernel core.
#[derive(Clone)]
pub struct KernelConfig {
    pub topology: TopologySpec,
    pub clock: ClockRef,
    /// Physical pages owned by each NUMA domain.
    pub pages_per_domain: u64,
    pub slab: SlabConfig,
    /// Kernel stack arena.
    pub stack_vas_base: VirtAddr,
    pub stack_vas_len: u64,
    /// Seed of the scheduling jitter PRNG.
    pub rng_seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            topology: TopologySpec::uniform(1),
            clock: Arc::new(ManualClock::new()),
            pages_per_domain: 4096,
            slab: SlabConfig::default(),
            stack_vas_base: 0x2000_0000,
            stack_vas_len: 64 * 1024 * 1024,
            rng_seed: 0x5EED,
        }
    }
}

impl KernelConfig {
    /// A config over `cpus` CPUs in one domain with a manual clock.
    #[must_use]
    pub fn uniform(cpus: usize) -> Self {
        Self {
            topology: TopologySpec::uniform(cpus),
            ..Self::default()
        }
    }
}
