//! Mutex implementation for the hypervisor
//!
//! A recursive, owner-tracked mutex. Contended entry puts the fiber to
//! sleep on the mutex's wait queue after giving up the virtual CPU, and
//! retries after every wakeup since a wakeup does not hand over the lock.

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::core::sched::{Holder, Lwp, Scheduler, WaitQueue};
use crate::core::vmm::vcpu::Cpu;
use crate::{Error, Result};

bitflags! {
    /// Mutex creation flags, as encoded by the hypercall ABI
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: i32 {
        /// Spin mutex in the kernel
        const SPIN = 0x01;
        /// Backs a kernel `kmutex`
        const KMUTEX = 0x02;
    }
}

/// Mutex state
#[derive(Debug, Default)]
struct MutexState {
    /// Recursion depth
    v: u32,
    /// Current owner, set exactly while `v > 0`
    owner: Option<Holder>,
}

/// A recursive mutex that can block waiting fibers
#[derive(Debug)]
pub struct RumpMutex {
    /// Flags fixed at creation
    flags: MutexFlags,
    /// Depth and owner
    state: Mutex<MutexState>,
    /// Fibers waiting for the mutex
    waiters: WaitQueue,
}

impl RumpMutex {
    /// Create a new, unowned mutex
    pub fn new(flags: MutexFlags) -> Self {
        Self {
            flags,
            state: Mutex::new(MutexState::default()),
            waiters: WaitQueue::new(),
        }
    }

    /// Get the creation flags
    pub fn flags(&self) -> MutexFlags {
        self.flags
    }

    /// Whether the mutex backs a kernel spin mutex
    pub fn is_spin_kmutex(&self) -> bool {
        self.flags.contains(MutexFlags::KMUTEX | MutexFlags::SPIN)
    }

    /// Try to acquire the mutex without blocking
    ///
    /// Succeeds when the mutex is free or already owned by the caller, in
    /// which case the recursion depth grows by one.
    pub fn try_enter(&self, sched: &Scheduler) -> Result<()> {
        let me = sched.current_holder();
        let mut state = self.state.lock();
        if state.v > 0 && state.owner != Some(me) {
            return Err(Error::ResourceBusy);
        }

        state.v += 1;
        state.owner = Some(me);
        Ok(())
    }

    /// Acquire the mutex, blocking if necessary
    pub fn enter(&self, cpu: &Cpu<'_>) {
        if self.try_enter(cpu.sched()).is_ok() {
            return;
        }

        let nesting = cpu.release(None);
        self.enter_unscheduled(cpu.sched());
        cpu.reacquire(nesting, None);
    }

    /// Acquire the mutex while not holding the virtual CPU
    pub(crate) fn enter_unscheduled(&self, sched: &Scheduler) {
        while self.try_enter(sched).is_err() {
            sched.wait(&self.waiters, None);
        }
    }

    /// Acquire the mutex without ever yielding
    ///
    /// With a single virtual CPU and no preemption this cannot fail; a
    /// failure means two fibers contended outside the yielding path.
    pub fn enter_no_yield(&self, sched: &Scheduler) {
        if self.try_enter(sched).is_err() {
            log::error!(
                "non-yielding mutex entry found the mutex held by {:?}",
                self.holder()
            );
            panic!("non-yielding mutex entry failed: mutex already held");
        }
    }

    /// Release one level of the mutex
    ///
    /// When the depth reaches zero the owner is cleared and one waiter is
    /// woken.
    pub fn exit(&self, sched: &Scheduler) {
        let released = {
            let mut state = self.state.lock();
            assert!(state.v > 0, "exiting a mutex that is not held");
            state.v -= 1;
            if state.v == 0 {
                state.owner = None;
            }
            state.v == 0
        };

        if released {
            sched.wakeup_one(&self.waiters);
        }
    }

    /// Get the lwp owning the mutex
    ///
    /// A holder without an attached lwp is reported as `None`.
    pub fn owner(&self) -> Option<Lwp> {
        self.state.lock().owner.and_then(Holder::lwp)
    }

    /// Get the identity owning the mutex
    pub fn holder(&self) -> Option<Holder> {
        self.state.lock().owner
    }

    /// Get the recursion depth
    pub fn depth(&self) -> u32 {
        self.state.lock().v
    }

    /// Get the number of fibers waiting for the mutex
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Destroy the mutex
    ///
    /// Destroying a mutex that is held or waited on is a contract violation.
    pub fn destroy(self) {
        let state = self.state.lock();
        assert!(
            state.owner.is_none() && self.waiters.is_empty(),
            "destroying a mutex that is still in use"
        );
    }
}
