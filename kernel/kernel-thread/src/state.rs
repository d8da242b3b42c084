use bitflags::bitflags;

/// Lifecycle state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// The per-CPU idle thread; never enters the runqueues.
    IdleThread = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Sleeping = 4,
    Zombie = 5,
    Terminated = 6,
    Halted = 7,
}

impl ThreadState {
    #[must_use]
    pub const fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::IdleThread,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Sleeping,
            5 => Self::Zombie,
            6 => Self::Terminated,
            _ => Self::Halted,
        }
    }
}

/// Scheduling class, strictly ordered: higher value preempts lower.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PrioClass {
    Background = 0,
    Timeshare = 1,
    Rt = 2,
    Urgent = 3,
}

impl PrioClass {
    pub const COUNT: usize = 4;

    #[must_use]
    pub const fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::Background,
            1 => Self::Timeshare,
            2 => Self::Rt,
            _ => Self::Urgent,
        }
    }

    /// Classes that account runtime against a timeslice.
    #[must_use]
    pub const fn has_timeslice(self) -> bool {
        matches!(self, Self::Timeshare | Self::Background)
    }

    #[must_use]
    pub const fn is_realtime(self) -> bool {
        matches!(self, Self::Rt | Self::Urgent)
    }
}

/// Behavioral classification derived from the activity window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ActivityClass {
    CpuBound,
    IoBound,
    Interactive,
    Sleepy,
    #[default]
    Unknown,
}

/// How a wait may be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum WaitType {
    #[default]
    None = 0,
    /// Any wake source releases the wait.
    Interruptible = 1,
    /// Only the expected wake source releases the wait.
    Uninterruptible = 2,
}

impl WaitType {
    #[must_use]
    pub const fn from_raw(v: u8) -> Self {
        match v {
            1 => Self::Interruptible,
            2 => Self::Uninterruptible,
            _ => Self::None,
        }
    }
}

/// Why a thread was woken. Stored on the thread for condvar returns and
/// the activity event ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum WakeReason {
    #[default]
    None = 0,
    BlockingIo = 1,
    BlockingManual = 2,
    SleepTimeout = 3,
    SleepManual = 4,
    Signal = 5,
    Timeout = 6,
}

impl WakeReason {
    #[must_use]
    pub const fn is_from_block(self) -> bool {
        matches!(self, Self::BlockingIo | Self::BlockingManual)
    }

    #[must_use]
    pub const fn is_from_sleep(self) -> bool {
        matches!(self, Self::SleepTimeout | Self::SleepManual)
    }
}

/// Why a thread blocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockReason {
    Io = 1,
    Manual = 2,
    Unknown = 3,
}

/// Why a thread went to sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SleepReason {
    Manual = 1,
    Unknown = 2,
}

bitflags! {
    /// Sticky thread flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// The thread may not be stolen or migrated right now.
        const NO_STEAL = 1 << 0;
    }
}

/// Which container currently links the thread. A thread lives in at most
/// one runqueue or wait structure at a time; insertions assert on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueueResidence {
    #[default]
    None,
    /// FIFO runqueue of a non-timeshare class.
    RunqueueList,
    /// Timeshare runqueue tree (current period).
    RunqueueTree,
    /// Timeshare completed tree.
    CompletedTree,
    /// A turnstile or wait queue.
    WaitQueue,
    /// The per-CPU reaper list.
    Reaper,
}
