use crate::queue::Workqueue;
use crate::work::{WorkArgs, WorkFn};

use alloc::collections::BinaryHeap;
use alloc::sync::Arc;
use core::cmp::Reverse;
use kernel_sync::SpinLock;
use kernel_time::TimeMs;

/// A timer-fired one-shot work.
#[derive(Clone, Copy, Debug)]
pub struct DeferredEvent {
    pub due_ms: TimeMs,
    pub func: WorkFn,
    pub args: WorkArgs,
}

/// Min-heap of deferred events keyed by absolute due time. The scheduler
/// tick pops everything due and posts it to the local workqueue as
/// one-shot works.
pub struct DeferQueue {
    heap: SpinLock<BinaryHeap<Reverse<(TimeMs, u64)>>>,
    /// Payloads keyed by the heap's tiebreaker.
    slots: SpinLock<alloc::collections::BTreeMap<u64, DeferredEvent>>,
    seq: SpinLock<u64>,
}

impl Default for DeferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: SpinLock::new(BinaryHeap::new()),
            slots: SpinLock::new(alloc::collections::BTreeMap::new()),
            seq: SpinLock::new(0),
        }
    }

    /// Arms an event `delay_ms` from `now`.
    pub fn enqueue(&self, now: TimeMs, delay_ms: TimeMs, func: WorkFn, args: WorkArgs) {
        let due = now + delay_ms;
        let id = self.seq.with_lock(|s| {
            *s += 1;
            *s
        });
        self.slots.with_lock(|m| {
            m.insert(id, DeferredEvent { due_ms: due, func, args });
        });
        self.heap.with_lock(|h| h.push(Reverse((due, id))));
    }

    /// Pops every event due at `now` and posts it onto `wq`. Returns the
    /// number of events fired.
    pub fn pump(&self, now: TimeMs, wq: &Arc<Workqueue>) -> usize {
        let mut fired = 0;
        loop {
            let due = self.heap.with_lock(|h| {
                match h.peek() {
                    Some(Reverse((due, _))) if *due <= now => h.pop(),
                    _ => None,
                }
            });
            let Some(Reverse((_, id))) = due else { break };
            let Some(event) = self.slots.with_lock(|m| m.remove(&id)) else {
                continue;
            };
            // A full ring degrades to inline execution; the timer has
            // already fired, the work must not be lost.
            if wq.enqueue_oneshot(now, event.func, event.args).is_err() {
                (event.func)(event.args.arg1, event.args.arg2);
            }
            fired += 1;
        }
        fired
    }

    /// Earliest due time armed, if any.
    #[must_use]
    pub fn next_due(&self) -> Option<TimeMs> {
        self.heap.with_lock(|h| h.peek().map(|Reverse((due, _))| *due))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.with_lock(|m| m.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
