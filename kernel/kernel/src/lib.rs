//! # The kernel core
//!
//! Ties the subsystems together in their boot order — topology, buddy
//! zones, NUMA domains, slab, schedulers, workqueues — and exposes the
//! external surface: allocation, thread lifecycle, synchronization
//! constructors, workqueue entry points and deferred work.
//!
//! The embedder drives CPUs explicitly: `tick` advances accounting and
//! timers, `pick_next`/`yield_now` dispatch, the flush and reaper passes
//! run when their workers are scheduled. Everything downstream of
//! [`Kernel::boot`] reads the global through shared references; per-CPU
//! state is owned by its CPU at dispatch level.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod config;
mod error;
mod timers;

pub use config::KernelConfig;
pub use error::KernelError;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_buddy::{BuddyZone, PhysAddr};
use kernel_cpumask::CpuId;
use kernel_domain::{AllocBehavior, AllocFlags, DomainSet, FlushNotify};
use kernel_lock::{Condvar, Mutex, RwLock, Semaphore, TurnstileTable};
use kernel_sched::{SchedulerSet, TickAction};
use kernel_slab::SlabAllocator;
use kernel_sync::SpinLock;
use kernel_thread::{
    BlockReason, DEFAULT_STACK_SIZE, IdAllocator, PrioClass, SleepReason, Thread, ThreadEntry,
    ThreadRef, WaitType, WakeReason,
};
use kernel_time::{ClockRef, TimeMs};
use kernel_topology::{NumaId, Topology};
use kernel_vas::{VasArena, VirtAddr};
use kernel_workqueue::{WorkArgs, WorkFn, WorkqueueSet};

use timers::{TimerFire, TimerWheel};

/// Marks domains whose free queues want a flush pass.
struct FlushFlags {
    pending: Vec<AtomicBool>,
}

impl FlushNotify for FlushFlags {
    fn notify(&self, domain: NumaId) {
        self.pending[domain].store(true, Ordering::Release);
    }
}

/// The process-wide kernel global, published once after boot.
pub struct Kernel {
    pub topology: Arc<Topology>,
    pub clock: ClockRef,
    pub domains: Arc<DomainSet>,
    pub slab: Arc<SlabAllocator>,
    pub sched: Arc<SchedulerSet>,
    pub turnstiles: Arc<TurnstileTable>,
    pub workqueues: Arc<WorkqueueSet>,

    ids: IdAllocator,
    stack_vas: SpinLock<VasArena>,
    stack_backing: SpinLock<BTreeMap<VirtAddr, (PhysAddr, u64)>>,
    timers: TimerWheel,
    flush_flags: Arc<FlushFlags>,
}

impl Kernel {
    /// Boots the core: topology discovery, buddy zones, domain allocator,
    /// slab, schedulers, workqueues — in that order.
    #[must_use]
    pub fn boot(config: KernelConfig) -> Arc<Self> {
        let topology = Arc::new(Topology::build(&config.topology));
        let clock = config.clock;

        let zones: Vec<BuddyZone> = (0..topology.numa_count())
            .map(|d| {
                BuddyZone::with_free_range(
                    d,
                    d as u64 * config.pages_per_domain,
                    config.pages_per_domain,
                )
            })
            .collect();
        let domains = Arc::new(DomainSet::new(Arc::clone(&topology), zones));

        let slab = Arc::new(SlabAllocator::new(
            Arc::clone(&domains),
            Arc::clone(&clock),
            &config.slab,
        ));

        let sched = Arc::new(SchedulerSet::new(
            Arc::clone(&topology),
            Arc::clone(&clock),
            config.rng_seed,
        ));

        let workqueues = Arc::new(WorkqueueSet::new(topology.cpu_count()));

        let flush_flags = Arc::new(FlushFlags {
            pending: (0..topology.numa_count())
                .map(|_| AtomicBool::new(false))
                .collect(),
        });
        domains.set_flush_notify(Arc::clone(&flush_flags) as Arc<dyn FlushNotify>);

        log::info!(
            "kernel: booted {} cpu(s), {} domain(s), {} pages/domain",
            topology.cpu_count(),
            topology.numa_count(),
            config.pages_per_domain
        );

        Arc::new(Self {
            topology,
            clock,
            domains,
            slab,
            sched,
            turnstiles: Arc::new(TurnstileTable::new()),
            workqueues,
            ids: IdAllocator::new(),
            stack_vas: SpinLock::new(VasArena::new(
                config.stack_vas_base,
                config.stack_vas_base + config.stack_vas_len,
            )),
            stack_backing: SpinLock::new(BTreeMap::new()),
            timers: TimerWheel::new(),
            flush_flags,
        })
    }

    fn now(&self) -> TimeMs {
        self.clock.now_ms()
    }

    // ---- memory ----------------------------------------------------------

    /// Object allocation through the slab stack.
    pub fn alloc(
        &self,
        cpu: CpuId,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        self.slab.kmalloc(cpu, size, flags, behavior)
    }

    /// Zeroed allocation.
    pub fn alloc_zeroed(
        &self,
        cpu: CpuId,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        self.slab.kzalloc(cpu, size, flags, behavior)
    }

    /// Resizes an allocation, preserving the usable prefix.
    pub fn realloc(
        &self,
        cpu: CpuId,
        ptr: VirtAddr,
        size: u64,
        flags: AllocFlags,
        behavior: AllocBehavior,
    ) -> Option<VirtAddr> {
        self.slab.krealloc(cpu, ptr, size, flags, behavior)
    }

    /// Frees an object allocated by [`alloc`](Self::alloc).
    pub fn free(&self, cpu: CpuId, ptr: VirtAddr, behavior: AllocBehavior) {
        self.slab.kfree(cpu, ptr, behavior);
    }

    /// Raw contiguous pages from the domain allocator.
    pub fn alloc_pages(&self, cpu: CpuId, pages: u64, flags: AllocFlags) -> Option<PhysAddr> {
        self.domains.alloc_pages(cpu, pages, flags)
    }

    pub fn free_pages(&self, cpu: CpuId, addr: PhysAddr, pages: u64) {
        self.domains.free_pages(cpu, addr, pages);
    }

    /// Flush worker body: drains the free queues of domains whose flush
    /// flag was raised. Scheduled from the per-domain flush threads.
    pub fn run_flush_pass(&self) -> usize {
        let mut flushed = 0;
        for (domain, flag) in self.flush_flags.pending.iter().enumerate() {
            if flag.swap(false, Ordering::AcqRel) {
                self.domains.flush_free_queue(domain);
                flushed += 1;
            }
        }
        flushed
    }

    // ---- threads ---------------------------------------------------------

    /// Creates a thread with a stack carved from the stack arena and
    /// backed by domain pages. The thread starts READY but unqueued.
    pub fn thread_create(
        &self,
        creator_cpu: CpuId,
        name: &str,
        entry: Option<ThreadEntry>,
        arg: usize,
        stack_size: u64,
    ) -> Option<ThreadRef> {
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let pages = kernel_buddy::pages_for(stack_size);

        let base = self
            .stack_vas
            .with_lock(|v| v.alloc(pages * kernel_buddy::PAGE_SIZE, kernel_buddy::PAGE_SIZE))
            .ok()?;
        let Some(phys) = self.domains.alloc_pages(creator_cpu, pages, AllocFlags::default())
        else {
            self.stack_vas.with_lock(|v| v.free(base));
            return None;
        };
        self.stack_backing.with_lock(|m| m.insert(base, (phys, pages)));

        let id = self.ids.alloc();
        let t = Thread::new(
            id,
            String::from(name),
            entry,
            arg,
            (base, stack_size),
            self.topology.cpu_count(),
            creator_cpu,
            self.now(),
        );
        // Every thread is born with a turnstile to donate.
        t.owned_turnstile.store(1, Ordering::Release);
        Some(t)
    }

    /// Releases a terminated thread's stack and id. Called by the reaper
    /// pass after the scheduler frees the thread.
    fn thread_release_resources(&self, cpu: CpuId, stack_base: VirtAddr, id: u64) {
        if let Some((phys, pages)) = self.stack_backing.with_lock(|m| m.remove(&stack_base)) {
            self.domains.free_pages(cpu, phys, pages);
            self.stack_vas.with_lock(|v| v.free(stack_base));
        }
        self.ids.release(id);
    }

    /// Places a thread on the least-loaded allowed CPU.
    pub fn enqueue(&self, t: &ThreadRef) {
        self.sched.enqueue(t);
    }

    pub fn yield_now(&self, cpu: CpuId) -> Option<ThreadRef> {
        self.sched.yield_now(cpu)
    }

    /// Wakes `t` if its wait admits `wake_src`.
    pub fn wake(
        &self,
        waker_cpu: CpuId,
        t: &ThreadRef,
        reason: WakeReason,
        prio: PrioClass,
        wake_src: u64,
    ) -> bool {
        self.sched.wake(waker_cpu, t, reason, prio, wake_src)
    }

    /// Declares `t` blocked; the caller yields afterwards.
    pub fn block(&self, t: &ThreadRef, reason: BlockReason, wait: WaitType, src: u64) {
        self.sched.block(t, reason, wait, src);
    }

    pub fn migrate(&self, t: &ThreadRef, dest_cpu: CpuId) {
        self.sched.migrate(t, dest_cpu);
    }

    pub fn set_background(&self, t: &ThreadRef) {
        t.set_background();
    }

    pub fn set_timeshare(&self, t: &ThreadRef) {
        t.set_timeshare();
    }

    /// Retires the current thread of `cpu`; the reaper frees it later.
    pub fn exit_current(&self, cpu: CpuId) -> Option<ThreadRef> {
        self.sched.exit_current(cpu)
    }

    /// Reaper pass: frees dead threads whose grace period elapsed.
    /// Returns how many were released.
    pub fn reap(&self, cpu: CpuId) -> usize {
        self.sched.reap(cpu).len()
    }

    /// Full thread teardown for tests and cooperative exits: releases the
    /// stack and id once the scheduler has let go of the thread.
    pub fn release_thread(&self, cpu: CpuId, t: &ThreadRef) {
        let (stack_base, _) = t.stack;
        if stack_base != 0 {
            self.thread_release_resources(cpu, stack_base, t.id);
        } else {
            self.ids.release(t.id);
        }
    }

    // ---- sleeping and timers --------------------------------------------

    /// Puts the current thread of `cpu` to sleep for at least `ms`
    /// milliseconds. State-machine form: the wake arrives via the timer
    /// pump in [`tick`](Self::tick); the caller yields afterwards.
    pub fn sleep_current_ms(&self, cpu: CpuId, t: &ThreadRef, ms: TimeMs) -> u64 {
        let token = self.timers.new_token();
        self.sched
            .sleep(t, SleepReason::Manual, WaitType::Uninterruptible, token);
        self.timers.arm_sleep(self.now() + ms, token, t.clone());
        self.sched.yield_now(cpu);
        token
    }

    /// Arms a deferred one-shot work on `cpu`'s timer heap.
    pub fn defer_enqueue(&self, cpu: CpuId, func: WorkFn, args: WorkArgs, delay_ms: TimeMs) {
        self.workqueues
            .defer_enqueue(cpu, self.now(), delay_ms, func, args);
    }

    // ---- synchronization constructors -----------------------------------

    #[must_use]
    pub fn mutex_create(&self) -> Mutex {
        Mutex::new(&self.turnstiles)
    }

    #[must_use]
    pub fn rwlock_create(&self, ceiling: PrioClass) -> RwLock {
        RwLock::new(&self.turnstiles, ceiling)
    }

    #[must_use]
    pub fn condvar_create(&self) -> Condvar {
        Condvar::new(&self.turnstiles)
    }

    #[must_use]
    pub fn semaphore_create(&self, initial: u64) -> Semaphore {
        Semaphore::new(&self.turnstiles, initial)
    }

    /// Condvar wait with a timeout, via a deferred timer firing a
    /// TIMEOUT wake. Blocking form: call from the waiter's own context.
    pub fn condvar_wait_timeout(
        &self,
        cv: &Arc<Condvar>,
        lock: &Mutex,
        cpu: CpuId,
        t: &ThreadRef,
        timeout_ms: TimeMs,
    ) -> WakeReason {
        self.timers
            .arm_condvar_timeout(self.now() + timeout_ms, Arc::clone(cv), t.clone());
        cv.wait(&self.sched, &self.turnstiles, cpu, t, lock)
    }

    // ---- tick ------------------------------------------------------------

    /// The periodic tick of one CPU: fires due timers, pumps deferred
    /// events into the local workqueue, then runs scheduler accounting.
    pub fn tick(&self, cpu: CpuId) -> TickAction {
        let now = self.now();

        for fire in self.timers.take_due(now) {
            match fire {
                TimerFire::SleepWake { token, thread } => {
                    self.sched.wake(
                        cpu,
                        &thread,
                        WakeReason::SleepTimeout,
                        thread.perceived_class(),
                        token,
                    );
                }
                TimerFire::CondvarTimeout { cv, thread } => {
                    cv.timeout_wake(&self.sched, cpu, &thread);
                }
            }
        }

        self.workqueues.pump_deferred(cpu, now);
        self.sched.tick(cpu)
    }
}
