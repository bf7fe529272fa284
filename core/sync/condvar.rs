//! Condition variables
//!
//! A condition variable is a FIFO wait queue plus a count of the fibers
//! that are logically waiting. The count covers the whole wait, including
//! the relock of the mutex after wakeup, so it can run ahead of the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::sched::{Scheduler, WaitQueue, WakeReason};
use crate::core::sync::mutex::RumpMutex;
use crate::core::vmm::vcpu::{Cpu, Nesting};

/// Condition variable for use with [`RumpMutex`]
#[derive(Debug, Default)]
pub struct RumpCondvar {
    waiters: WaitQueue,
    nwaiters: AtomicUsize,
}

impl RumpCondvar {
    /// Create a new condition variable with no waiters
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically release `mtx` and wait for a signal
    pub fn wait(&self, cpu: &Cpu<'_>, mtx: &RumpMutex) {
        self.nwaiters.fetch_add(1, Ordering::SeqCst);
        let nesting = cpu.release(Some(mtx));
        mtx.exit(cpu.sched());
        cpu.sched().wait(&self.waiters, None);
        self.relock(cpu, mtx, nesting);
        self.nwaiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wait without releasing the virtual CPU
    ///
    /// Used by the hypervisor's own virtual-CPU implementation, which must
    /// not recurse into itself.
    pub fn wait_no_yield(&self, sched: &Scheduler, mtx: &RumpMutex) {
        self.nwaiters.fetch_add(1, Ordering::SeqCst);
        mtx.exit(sched);
        sched.wait(&self.waiters, None);
        mtx.enter_unscheduled(sched);
        self.nwaiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wait for a signal or until `timeout` elapses
    ///
    /// The timeout is truncated to whole milliseconds. The mutex is held
    /// again on return whichever way the wait ended.
    pub fn timed_wait(&self, cpu: &Cpu<'_>, mtx: &RumpMutex, timeout: Duration) -> WakeReason {
        let timeout = Duration::from_millis(timeout.as_millis().min(u64::MAX as u128) as u64);

        self.nwaiters.fetch_add(1, Ordering::SeqCst);
        let nesting = cpu.release(Some(mtx));
        mtx.exit(cpu.sched());
        let reason = cpu.sched().wait(&self.waiters, Some(timeout));
        self.relock(cpu, mtx, nesting);
        self.nwaiters.fetch_sub(1, Ordering::SeqCst);

        reason
    }

    /// Take `mtx` and the virtual CPU back after a wait
    ///
    /// A kernel spin mutex is entered with the virtual CPU already held, so
    /// the CPU is reacquired first; every other mutex is entered first.
    fn relock(&self, cpu: &Cpu<'_>, mtx: &RumpMutex, nesting: Nesting) {
        if mtx.is_spin_kmutex() {
            cpu.reacquire(nesting, Some(mtx));
            mtx.enter_no_yield(cpu.sched());
        } else {
            mtx.enter_unscheduled(cpu.sched());
            cpu.reacquire(nesting, Some(mtx));
        }
    }

    /// Wake the longest-waiting fiber
    pub fn signal(&self, sched: &Scheduler) {
        sched.wakeup_one(&self.waiters);
    }

    /// Wake every waiting fiber
    pub fn broadcast(&self, sched: &Scheduler) {
        sched.wakeup_all(&self.waiters);
    }

    /// Check whether any fiber is logically waiting
    pub fn has_waiters(&self) -> bool {
        self.waiter_count() > 0
    }

    /// Get the number of logically waiting fibers
    pub fn waiter_count(&self) -> usize {
        self.nwaiters.load(Ordering::SeqCst)
    }

    /// Destroy the condition variable
    ///
    /// A fiber woken but not yet back from its wait still counts as a
    /// waiter, so the count is checked rather than the queue.
    pub fn destroy(self) {
        assert_eq!(
            self.waiter_count(),
            0,
            "destroying a condition variable with waiters"
        );
    }
}
