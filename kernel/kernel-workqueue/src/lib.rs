//! # Workqueues and deferred work
//!
//! Every core owns one permanent workqueue; further queues may be created
//! bound or unbound. A queue feeds its workers from two tiers: a bounded
//! lockless ring of one-shot works (function pointer plus two argument
//! words) and a list of persistent [`Work`] items guarded against double
//! enqueue.
//!
//! The worker pool grows on demand — gated by a spawn delay, optionally
//! via a thread-request token so allocators can enqueue without recursing
//! into themselves — and shrinks again when workers sit idle past a
//! timeout that tightens as the pool grows.
//!
//! Deferred events are a min-heap keyed by absolute due time; each tick
//! pops what is due and reposts it as ordinary one-shot work.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod defer;
mod queue;
mod ring;
mod work;

pub use defer::{DeferQueue, DeferredEvent};
pub use queue::{
    SpawnToken, Worker, WorkerNextAction, Workqueue, WorkqueueAttributes, WorkqueueError,
    WorkqueueFlags,
};
pub use ring::WorkRing;
pub use work::{OneshotWork, Work, WorkArgs, WorkFn};

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_cpumask::CpuId;

/// The per-core permanent queues, created at boot.
pub struct WorkqueueSet {
    queues: Vec<Arc<Workqueue>>,
    defer: Vec<DeferQueue>,
}

impl WorkqueueSet {
    #[must_use]
    pub fn new(cpus: usize) -> Self {
        let attrs = WorkqueueAttributes {
            flags: WorkqueueFlags::PERMANENT | WorkqueueFlags::AUTO_SPAWN,
            ..WorkqueueAttributes::default()
        };
        Self {
            queues: (0..cpus)
                .map(|cpu| {
                    Arc::new(Workqueue::new(format!("kworker/{cpu}"), Some(cpu), attrs.clone()))
                })
                .collect(),
            defer: (0..cpus).map(|_| DeferQueue::new()).collect(),
        }
    }

    #[must_use]
    pub fn local(&self, cpu: CpuId) -> &Arc<Workqueue> {
        &self.queues[cpu]
    }

    #[must_use]
    pub fn defer_queue(&self, cpu: CpuId) -> &DeferQueue {
        &self.defer[cpu]
    }

    /// Least-loaded permanent queue, excluding `except` when given.
    #[must_use]
    pub fn least_loaded(&self, except: Option<CpuId>) -> &Arc<Workqueue> {
        self.queues
            .iter()
            .enumerate()
            .filter(|(cpu, _)| Some(*cpu) != except)
            .min_by_key(|(_, q)| q.pending_tasks())
            .map(|(_, q)| q)
            .unwrap_or(&self.queues[0])
    }

    /// Posts a one-shot on the local core's queue.
    pub fn add_local(
        &self,
        cpu: CpuId,
        now: u64,
        func: WorkFn,
        args: WorkArgs,
    ) -> Result<(), WorkqueueError> {
        self.queues[cpu].enqueue_oneshot(now, func, args)
    }

    /// Posts a one-shot on the least-loaded remote queue.
    pub fn add_remote(
        &self,
        cpu: CpuId,
        now: u64,
        func: WorkFn,
        args: WorkArgs,
    ) -> Result<(), WorkqueueError> {
        self.least_loaded(Some(cpu)).enqueue_oneshot(now, func, args)
    }

    /// Posts a one-shot wherever the least work is pending.
    pub fn add_fast(&self, now: u64, func: WorkFn, args: WorkArgs) -> Result<(), WorkqueueError> {
        self.least_loaded(None).enqueue_oneshot(now, func, args)
    }

    /// Arms a deferred event on `cpu`'s timer heap.
    pub fn defer_enqueue(&self, cpu: CpuId, now: u64, delay_ms: u64, func: WorkFn, args: WorkArgs) {
        self.defer[cpu].enqueue(now, delay_ms, func, args);
    }

    /// Tick hook: fires due deferred events into the local queue.
    pub fn pump_deferred(&self, cpu: CpuId, now: u64) -> usize {
        self.defer[cpu].pump(now, &self.queues[cpu])
    }
}
