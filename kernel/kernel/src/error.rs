use thiserror::Error;

/// Recoverable error kinds the core surfaces to its embedder.
///
/// Lock-protocol violations (unlock by non-owner, double free, a priority
/// inheritance cycle, invariant corruption) are not here: those are bugs
/// and panic with diagnostics instead of unwinding through `Result`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource busy")]
    Busy,
    #[error("timed out")]
    Timeout,
    #[error("operation would block")]
    WouldBlock,
}

impl crate::Kernel {
    /// [`alloc`](crate::Kernel::alloc) with an error instead of a null
    /// return; OOM survives one emergency GC pass before surfacing.
    pub fn try_alloc(
        &self,
        cpu: kernel_cpumask::CpuId,
        size: u64,
        flags: kernel_domain::AllocFlags,
        behavior: kernel_domain::AllocBehavior,
    ) -> Result<kernel_vas::VirtAddr, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.alloc(cpu, size, flags, behavior)
            .ok_or(KernelError::OutOfMemory)
    }

    /// [`alloc_pages`](crate::Kernel::alloc_pages) with an error return.
    pub fn try_alloc_pages(
        &self,
        cpu: kernel_cpumask::CpuId,
        pages: u64,
        flags: kernel_domain::AllocFlags,
    ) -> Result<kernel_buddy::PhysAddr, KernelError> {
        if pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.alloc_pages(cpu, pages, flags)
            .ok_or(KernelError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;

    #[test]
    fn zero_size_is_invalid() {
        let k = crate::Kernel::boot(KernelConfig::uniform(1));
        assert_eq!(
            k.try_alloc(
                0,
                0,
                kernel_domain::AllocFlags::default(),
                kernel_domain::AllocBehavior::MayFault
            ),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            k.try_alloc_pages(0, 0, kernel_domain::AllocFlags::default()),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn successful_alloc_roundtrips() {
        let k = crate::Kernel::boot(KernelConfig::uniform(1));
        let p = k
            .try_alloc(
                0,
                64,
                kernel_domain::AllocFlags::default(),
                kernel_domain::AllocBehavior::MayFault,
            )
            .unwrap();
        k.free(0, p, kernel_domain::AllocBehavior::MayFault);
    }
}
