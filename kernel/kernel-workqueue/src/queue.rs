use crate::ring::WorkRing;
use crate::work::{OneshotWork, Work, WorkArgs, WorkFn};

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_cpumask::CpuId;
use kernel_thread::ThreadRef;
use kernel_time::TimeMs;
use kernel_sync::SpinLock;

bitflags! {
    /// Behavior switches of a workqueue.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WorkqueueFlags: u16 {
        /// Attached to a core and kept alive for the machine's lifetime.
        const PERMANENT = 1 << 1;
        /// Spawn extra workers when enqueues find nobody idle.
        const AUTO_SPAWN = 1 << 2;
        /// Workers stay pinned to the queue's core.
        const UNMIGRATABLE_WORKERS = 1 << 3;
        /// Spawn through a thread-request token instead of calling the
        /// allocator inline, so allocators can use the queue safely.
        const SPAWN_VIA_REQUEST = 1 << 5;
        /// Never time idle workers out.
        const NO_WORKER_GC = 1 << 7;
    }
}

impl Default for WorkqueueFlags {
    fn default() -> Self {
        Self::AUTO_SPAWN
    }
}

/// Sizing and pacing attributes.
#[derive(Clone, Debug)]
pub struct WorkqueueAttributes {
    pub min_workers: usize,
    pub max_workers: usize,
    pub capacity: usize,
    /// Minimum gap between two spawn attempts.
    pub spawn_delay_ms: TimeMs,
    /// Idle window bounds; the effective timeout shrinks as the worker
    /// count grows.
    pub idle_check_min_ms: TimeMs,
    pub idle_check_max_ms: TimeMs,
    pub flags: WorkqueueFlags,
}

impl Default for WorkqueueAttributes {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 16,
            capacity: 512,
            spawn_delay_ms: 150,
            idle_check_min_ms: 2_000,
            idle_check_max_ms: 40_000,
            flags: WorkqueueFlags::default(),
        }
    }
}

/// What a worker should do after its current pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerNextAction {
    Run,
    Exit,
}

/// Bookkeeping of one worker thread.
pub struct Worker {
    pub thread: Option<ThreadRef>,
    pub last_active_ms: TimeMs,
    pub start_idle_ms: TimeMs,
    pub idle: bool,
    pub permanent: bool,
    pub timeout_ran: bool,
    pub should_exit: bool,
    pub next_action: WorkerNextAction,
}

/// A request to spawn a worker out of line; consumed by whoever services
/// thread requests (set when SPAWN_VIA_REQUEST is on).
#[derive(Debug, Default)]
pub struct SpawnToken {
    pub pending: AtomicBool,
}

/// One workqueue: a bounded one-shot ring plus a list of persistent works,
/// drained by a pool of workers that grows on demand and shrinks on idle
/// timeout.
pub struct Workqueue {
    pub name: String,
    attrs: WorkqueueAttributes,
    /// Core this queue is bound to; `None` for unbound queues.
    core: Option<CpuId>,

    ring: WorkRing,
    works: SpinLock<VecDeque<Arc<Work>>>,
    workers: SpinLock<Vec<Worker>>,

    num_workers: AtomicU32,
    idle_workers: AtomicU32,
    num_tasks: AtomicU32,
    ignore_timeouts: AtomicBool,

    last_spawn_attempt_ms: AtomicU64,
    pub spawn_token: SpawnToken,
    /// Enqueues that found no idle worker; a kick signal for the embedder
    /// driving the worker pool.
    pub kicks: AtomicU64,
}

/// Error surface of the enqueue paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WorkqueueError {
    /// Ring full; the enqueue would have to block.
    #[error("workqueue ring full")]
    Full,
    /// The work is already queued.
    #[error("work already enqueued")]
    AlreadyEnqueued,
}

impl Workqueue {
    #[must_use]
    pub fn new(name: String, core: Option<CpuId>, attrs: WorkqueueAttributes) -> Self {
        let ring = WorkRing::new(attrs.capacity);
        Self {
            name,
            attrs,
            core,
            ring,
            works: SpinLock::new(VecDeque::new()),
            workers: SpinLock::new(Vec::new()),
            num_workers: AtomicU32::new(0),
            idle_workers: AtomicU32::new(0),
            num_tasks: AtomicU32::new(0),
            ignore_timeouts: AtomicBool::new(false),
            last_spawn_attempt_ms: AtomicU64::new(0),
            spawn_token: SpawnToken::default(),
            kicks: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn core(&self) -> Option<CpuId> {
        self.core
    }

    #[must_use]
    pub const fn attrs(&self) -> &WorkqueueAttributes {
        &self.attrs
    }

    #[must_use]
    pub fn pending_tasks(&self) -> u32 {
        self.num_tasks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn worker_count(&self) -> u32 {
        self.num_workers.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn idle_worker_count(&self) -> u32 {
        self.idle_workers.load(Ordering::Acquire)
    }

    pub fn set_ignore_timeouts(&self, on: bool) {
        self.ignore_timeouts.store(on, Ordering::Release);
    }

    // ---- enqueue ---------------------------------------------------------

    /// Queues a one-shot work. Fails only when the ring is full.
    pub fn enqueue_oneshot(
        &self,
        now: TimeMs,
        func: WorkFn,
        args: WorkArgs,
    ) -> Result<(), WorkqueueError> {
        if !self.ring.enqueue(OneshotWork { func, args }) {
            return Err(WorkqueueError::Full);
        }
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
        self.after_enqueue(now);
        Ok(())
    }

    /// Queues a persistent work; rejected while already enqueued.
    pub fn enqueue(&self, now: TimeMs, work: &Arc<Work>) -> Result<(), WorkqueueError> {
        if work.enqueued.swap(true, Ordering::AcqRel) {
            return Err(WorkqueueError::AlreadyEnqueued);
        }
        self.works.with_lock(|w| w.push_back(Arc::clone(work)));
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
        self.after_enqueue(now);
        Ok(())
    }

    /// Signals a worker and arms the spawn machinery when everyone is
    /// busy.
    fn after_enqueue(&self, now: TimeMs) {
        self.kicks.fetch_add(1, Ordering::Relaxed);

        if self.idle_worker_count() > 0 {
            return;
        }
        if !self.attrs.flags.contains(WorkqueueFlags::AUTO_SPAWN) {
            return;
        }
        if self.worker_count() as usize >= self.attrs.max_workers {
            return;
        }

        // Spawn-delay gate: at most one attempt per window.
        let last = self.last_spawn_attempt_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.attrs.spawn_delay_ms && last != 0 {
            return;
        }
        if self
            .last_spawn_attempt_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        if self.attrs.flags.contains(WorkqueueFlags::SPAWN_VIA_REQUEST) {
            // Leave a token for the thread-request service; no allocation
            // happens on this path.
            self.spawn_token.pending.store(true, Ordering::Release);
        } else {
            self.add_worker(None, now, false);
        }
    }

    // ---- worker pool -----------------------------------------------------

    /// Registers a worker with the pool. `thread` may be attached later by
    /// the embedder (spawn-via-request path).
    pub fn add_worker(&self, thread: Option<ThreadRef>, now: TimeMs, permanent: bool) -> usize {
        let idx = self.workers.with_lock(|ws| {
            ws.push(Worker {
                thread,
                last_active_ms: now,
                start_idle_ms: now,
                idle: true,
                permanent,
                timeout_ran: false,
                should_exit: false,
                next_action: WorkerNextAction::Run,
            });
            ws.len() - 1
        });
        self.num_workers.fetch_add(1, Ordering::AcqRel);
        self.idle_workers.fetch_add(1, Ordering::AcqRel);
        log::debug!("{}: worker {idx} joined the pool", self.name);
        idx
    }

    /// Takes one task, ring first, then the persistent list.
    fn dequeue_task(&self) -> Option<TaskKind> {
        if let Some(w) = self.ring.dequeue() {
            self.num_tasks.fetch_sub(1, Ordering::AcqRel);
            return Some(TaskKind::Oneshot(w));
        }
        let work = self.works.with_lock(VecDeque::pop_front);
        if let Some(w) = work {
            self.num_tasks.fetch_sub(1, Ordering::AcqRel);
            return Some(TaskKind::Persistent(w));
        }
        None
    }

    /// One worker pass: drains available tasks and updates idle state.
    /// Returns what the worker should do next.
    pub fn worker_pass(&self, worker_idx: usize, now: TimeMs) -> WorkerNextAction {
        let was_idle = self.workers.with_lock(|ws| {
            let w = &mut ws[worker_idx];
            let was = w.idle;
            w.idle = false;
            was
        });
        if was_idle {
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);
        }

        let mut ran = 0usize;
        while let Some(task) = self.dequeue_task() {
            match task {
                TaskKind::Oneshot(w) => (w.func)(w.args.arg1, w.args.arg2),
                TaskKind::Persistent(w) => {
                    w.enqueued.store(false, Ordering::Release);
                    w.execute();
                }
            }
            ran += 1;
        }

        self.workers.with_lock(|ws| {
            let w = &mut ws[worker_idx];
            if ran > 0 {
                w.last_active_ms = now;
                w.timeout_ran = false;
            }
            if !w.idle {
                w.idle = true;
                w.start_idle_ms = now;
                self.idle_workers.fetch_add(1, Ordering::AcqRel);
            }

            let next = if self.worker_should_exit(w, now) {
                w.should_exit = true;
                WorkerNextAction::Exit
            } else {
                WorkerNextAction::Run
            };
            w.next_action = next;
            next
        })
    }

    /// The idle timeout scales down as the pool grows, so an overgrown
    /// pool drains quickly while a minimal one lingers.
    #[must_use]
    pub fn idle_timeout_ms(&self) -> TimeMs {
        let workers = u64::from(self.worker_count()).max(1);
        (self.attrs.idle_check_max_ms / workers).max(self.attrs.idle_check_min_ms)
    }

    fn worker_should_exit(&self, w: &Worker, now: TimeMs) -> bool {
        if w.permanent
            || self.ignore_timeouts.load(Ordering::Acquire)
            || self.attrs.flags.contains(WorkqueueFlags::NO_WORKER_GC)
        {
            return false;
        }
        if self.worker_count() as usize <= self.attrs.min_workers.max(1) {
            return false;
        }
        now.saturating_sub(w.start_idle_ms) >= self.idle_timeout_ms()
    }

    /// Removes a worker that decided to exit; returns its thread for the
    /// embedder to retire.
    pub fn retire_worker(&self, worker_idx: usize) -> Option<ThreadRef> {
        let (thread, was_idle) = self.workers.with_lock(|ws| {
            let w = ws.remove(worker_idx);
            (w.thread, w.idle)
        });
        self.num_workers.fetch_sub(1, Ordering::AcqRel);
        if was_idle {
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);
        }
        thread
    }
}

enum TaskKind {
    Oneshot(OneshotWork),
    Persistent(Arc<Work>),
}
