//! Virtual CPU (VCPU) Management
//!
//! The rump kernel runs on a single virtual CPU. Kernel code may only run
//! while the CPU is held; every blocking primitive gives it up before it
//! waits and takes it back after waking, restoring the nesting depth the
//! kernel had at the time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::sched::{current_fiber, FiberId, Scheduler};
use crate::core::sync::{MutexFlags, RumpCondvar, RumpMutex};

/// Nesting depth of the virtual CPU held by a fiber
///
/// Handed out by [`VirtualCpu::release`] and handed back, unchanged, to
/// [`VirtualCpu::reacquire`]. Zero means the caller did not hold the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nesting(pub i32);

/// Virtual CPU scheduling handshake
pub trait VirtualCpu: Send + Sync {
    /// Give up the virtual CPU ahead of a block
    ///
    /// `interlock` is the mutex the caller is about to give up, if any.
    fn release(&self, interlock: Option<&RumpMutex>) -> Nesting;

    /// Take the virtual CPU back after a block
    fn reacquire(&self, nesting: Nesting, interlock: Option<&RumpMutex>);
}

/// Capability to block: the scheduler plus the virtual CPU to hand back
///
/// Every operation that may suspend the caller takes a `Cpu`, so the
/// release/reacquire handshake cannot be skipped.
#[derive(Clone, Copy)]
pub struct Cpu<'a> {
    sched: &'a Scheduler,
    vcpu: &'a dyn VirtualCpu,
}

impl<'a> Cpu<'a> {
    /// Bundle a scheduler with a virtual CPU
    pub fn new(sched: &'a Scheduler, vcpu: &'a dyn VirtualCpu) -> Self {
        Self { sched, vcpu }
    }

    /// Get the scheduler
    pub fn sched(&self) -> &'a Scheduler {
        self.sched
    }

    /// Give up the virtual CPU
    pub fn release(&self, interlock: Option<&RumpMutex>) -> Nesting {
        let nesting = self.vcpu.release(interlock);
        log::trace!("released virtual cpu (nesting {})", nesting.0);
        nesting
    }

    /// Take the virtual CPU back
    pub fn reacquire(&self, nesting: Nesting, interlock: Option<&RumpMutex>) {
        self.vcpu.reacquire(nesting, interlock);
        log::trace!("reacquired virtual cpu (nesting {})", nesting.0);
    }
}

/// Holder of the token and its depth
#[derive(Debug, Default)]
struct TokenState {
    holder: Option<FiberId>,
    depth: i32,
}

/// Single virtual CPU implemented on top of this crate's own primitives
///
/// The token is built from a mutex and a condition variable used through
/// their non-yielding entry points, since blocking on them must not try to
/// release the token being waited for.
pub struct VcpuToken {
    sched: Arc<Scheduler>,
    lock: RumpMutex,
    free: RumpCondvar,
    /// Only changed with `lock` held
    state: Mutex<TokenState>,
}

impl VcpuToken {
    /// Create a free token
    pub fn new(sched: Arc<Scheduler>) -> Self {
        Self {
            sched,
            lock: RumpMutex::new(MutexFlags::empty()),
            free: RumpCondvar::new(),
            state: Mutex::new(TokenState::default()),
        }
    }

    fn me(&self) -> FiberId {
        match current_fiber() {
            Some(id) => id,
            None => panic!("virtual cpu used from a host thread that is not a fiber"),
        }
    }

    /// Wait for the token and add `depth` holds to it
    fn acquire(&self, depth: i32) {
        let me = self.me();
        self.lock.enter_no_yield(&self.sched);
        loop {
            let holder = self.state.lock().holder;
            if holder.is_none() || holder == Some(me) {
                break;
            }
            self.free.wait_no_yield(&self.sched, &self.lock);
        }

        {
            let mut state = self.state.lock();
            state.holder = Some(me);
            state.depth += depth;
        }
        self.lock.exit(&self.sched);
    }

    /// Take the virtual CPU, or add a nested hold if already held
    pub fn schedule(&self) {
        self.acquire(1);
    }

    /// Drop one hold; the last one frees the virtual CPU
    pub fn unschedule(&self) {
        let me = self.me();
        self.lock.enter_no_yield(&self.sched);
        let freed = {
            let mut state = self.state.lock();
            assert_eq!(
                state.holder,
                Some(me),
                "unscheduling a virtual cpu the fiber does not hold"
            );
            state.depth -= 1;
            if state.depth == 0 {
                state.holder = None;
            }
            state.depth == 0
        };

        if freed {
            self.free.signal(&self.sched);
        }
        self.lock.exit(&self.sched);
    }

    /// Get the fiber holding the virtual CPU
    pub fn holder(&self) -> Option<FiberId> {
        self.state.lock().holder
    }

    /// Get the nesting depth of the current hold
    pub fn depth(&self) -> i32 {
        self.state.lock().depth
    }
}

impl VirtualCpu for VcpuToken {
    fn release(&self, _interlock: Option<&RumpMutex>) -> Nesting {
        let me = self.me();
        self.lock.enter_no_yield(&self.sched);
        let nesting = {
            let mut state = self.state.lock();
            if state.holder == Some(me) {
                let depth = state.depth;
                state.holder = None;
                state.depth = 0;
                Nesting(depth)
            } else {
                Nesting(0)
            }
        };

        if nesting.0 > 0 {
            self.free.signal(&self.sched);
        }
        self.lock.exit(&self.sched);
        nesting
    }

    fn reacquire(&self, nesting: Nesting, _interlock: Option<&RumpMutex>) {
        if nesting.0 > 0 {
            self.acquire(nesting.0);
        }
    }
}
