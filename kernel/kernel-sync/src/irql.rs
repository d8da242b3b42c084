use core::sync::atomic::{AtomicU8, Ordering};

/// Interrupt request level of a CPU.
///
/// The ordered ladder gating what a CPU may do:
///
/// * `Passive` — normal thread execution; may block and take faults.
/// * `Dispatch` — the scheduler itself runs here; preemption is off.
/// * `Device` — device interrupt handling.
/// * `High` — most allocations and all blocking are forbidden.
///
/// Most core hot paths raise to `Dispatch` for the duration of a queue
/// manipulation and restore on guard drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum IrqLevel {
    Passive = 0,
    Dispatch = 1,
    Device = 2,
    High = 3,
}

impl IrqLevel {
    const fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::Passive,
            1 => Self::Dispatch,
            2 => Self::Device,
            _ => Self::High,
        }
    }
}

/// Per-CPU IRQL word.
///
/// Owned by the CPU's scheduler structure; only the owning CPU raises and
/// lowers it, other CPUs may observe it.
#[derive(Debug)]
pub struct IrqState {
    level: AtomicU8,
}

impl Default for IrqState {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            level: AtomicU8::new(IrqLevel::Passive as u8),
        }
    }

    /// Current level of this CPU.
    #[must_use]
    pub fn current(&self) -> IrqLevel {
        IrqLevel::from_raw(self.level.load(Ordering::Acquire))
    }

    /// Raises to `level` and returns the previous level.
    ///
    /// Raising to a level below the current one keeps the current level, the
    /// way nested raises are expected to behave.
    pub fn raise(&self, level: IrqLevel) -> IrqLevel {
        let prev = IrqLevel::from_raw(self.level.fetch_max(level as u8, Ordering::AcqRel));
        debug_assert!(prev <= IrqLevel::High);
        prev
    }

    /// Lowers back to a previously returned level.
    ///
    /// # Panics
    /// Panics if `to` is above the current level; lowering must unwind raises
    /// in order.
    pub fn lower(&self, to: IrqLevel) {
        let curr = self.current();
        assert!(to <= curr, "irql lower to {to:?} above current {curr:?}");
        self.level.store(to as u8, Ordering::Release);
    }

    /// RAII form: raises to `level`, restoring on guard drop.
    pub fn raise_guard(&self, level: IrqLevel) -> IrqlGuard<'_> {
        let prev = self.raise(level);
        IrqlGuard { state: self, prev }
    }
}

/// Restores the previous IRQL when dropped.
pub struct IrqlGuard<'a> {
    state: &'a IrqState,
    prev: IrqLevel,
}

impl IrqlGuard<'_> {
    /// The level that was active before the raise.
    #[must_use]
    pub const fn previous(&self) -> IrqLevel {
        self.prev
    }
}

impl Drop for IrqlGuard<'_> {
    fn drop(&mut self) {
        self.state.lower(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_lower_roundtrip() {
        let s = IrqState::new();
        assert_eq!(s.current(), IrqLevel::Passive);
        let prev = s.raise(IrqLevel::Dispatch);
        assert_eq!(prev, IrqLevel::Passive);
        assert_eq!(s.current(), IrqLevel::Dispatch);
        s.lower(prev);
        assert_eq!(s.current(), IrqLevel::Passive);
    }

    #[test]
    fn nested_raise_keeps_highest() {
        let s = IrqState::new();
        let p0 = s.raise(IrqLevel::High);
        let p1 = s.raise(IrqLevel::Dispatch);
        assert_eq!(p1, IrqLevel::High, "nested raise below current is a no-op");
        assert_eq!(s.current(), IrqLevel::High);
        s.lower(p1);
        s.lower(p0);
    }

    #[test]
    fn guard_restores_on_drop() {
        let s = IrqState::new();
        {
            let _g = s.raise_guard(IrqLevel::Dispatch);
            assert_eq!(s.current(), IrqLevel::Dispatch);
        }
        assert_eq!(s.current(), IrqLevel::Passive);
    }
}
