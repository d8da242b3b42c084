use core::sync::atomic::{AtomicBool, Ordering};

/// A work callback: a plain function pointer and two argument words, the
/// shape ISRs and allocators can construct without allocating.
pub type WorkFn = fn(arg1: usize, arg2: usize);

/// Arguments of one work item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkArgs {
    pub arg1: usize,
    pub arg2: usize,
}

impl WorkArgs {
    #[must_use]
    pub const fn new(arg1: usize, arg2: usize) -> Self {
        Self { arg1, arg2 }
    }
}

/// A persistent work item: enqueued many times, never dropped by the
/// queue. `enqueued` guards against double enqueue, `active` marks the
/// callback as running.
pub struct Work {
    pub func: WorkFn,
    pub args: WorkArgs,
    pub enqueued: AtomicBool,
    pub active: AtomicBool,
}

impl Work {
    #[must_use]
    pub const fn new(func: WorkFn, args: WorkArgs) -> Self {
        Self {
            func,
            args,
            enqueued: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    /// Runs the callback with the active flag held.
    pub fn execute(&self) {
        self.active.store(true, Ordering::Release);
        (self.func)(self.args.arg1, self.args.arg2);
        self.active.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// A one-shot work item as stored in the ring.
#[derive(Clone, Copy, Debug)]
pub struct OneshotWork {
    pub func: WorkFn,
    pub args: WorkArgs,
}
