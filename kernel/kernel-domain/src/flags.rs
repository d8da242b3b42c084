use bitflags::bitflags;

/// Strictest locality: only the local domain is considered.
pub const LOCALITY_MAX: u8 = 8;
/// Loosest locality: the whole zonelist is fair game.
pub const LOCALITY_MIN: u8 = 0;

bitflags! {
    /// Modifier bits of an allocation request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AllocOpts: u8 {
        /// Backing pages may be paged out later.
        const PAGEABLE = 1 << 0;
        /// Scale the allocation up to a cache line if it is close.
        const PREFER_CACHE_ALIGNED = 1 << 1;
        /// Ignore the locality budget when the preferred domains are full.
        const FLEXIBLE_LOCALITY = 1 << 2;
        /// Round-robin the allocation across domains.
        const CLASS_INTERLEAVED = 1 << 3;
    }
}

/// Full allocation flag word: modifiers plus a locality degree in
/// `[LOCALITY_MIN, LOCALITY_MAX]` where max means strict-local.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocFlags {
    pub opts: AllocOpts,
    pub locality: u8,
}

impl Default for AllocFlags {
    fn default() -> Self {
        Self {
            opts: AllocOpts::empty(),
            locality: LOCALITY_MAX,
        }
    }
}

impl AllocFlags {
    #[must_use]
    pub fn new(opts: AllocOpts) -> Self {
        Self {
            opts,
            ..Self::default()
        }
    }

    /// Sets the locality degree, clamped to the valid range.
    #[must_use]
    pub fn with_locality(mut self, degree: u8) -> Self {
        self.locality = degree.min(LOCALITY_MAX);
        self
    }

    #[must_use]
    pub const fn pageable(&self) -> bool {
        self.opts.contains(AllocOpts::PAGEABLE)
    }

    #[must_use]
    pub const fn interleaved(&self) -> bool {
        self.opts.contains(AllocOpts::CLASS_INTERLEAVED)
    }

    #[must_use]
    pub const fn flexible(&self) -> bool {
        self.opts.contains(AllocOpts::FLEXIBLE_LOCALITY)
    }
}

/// How much latitude the caller gives the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AllocBehavior {
    /// Stay on the fast path; skip drains and GC.
    Fast,
    /// Full service: drains, GC retry, may take faults.
    #[default]
    MayFault,
    /// Must not touch anything that could fault.
    NoFault,
}

impl AllocBehavior {
    #[must_use]
    pub const fn may_fault(self) -> bool {
        matches!(self, Self::MayFault)
    }

    #[must_use]
    pub const fn is_fast(self) -> bool {
        matches!(self, Self::Fast)
    }
}
