//! Scheduler module
//!
//! This module provides the cooperative fiber engine the hypercall layer
//! runs on. Fibers are backed by host threads, but only the fiber that
//! currently holds the scheduler's CPU executes; every other fiber stays
//! parked until the CPU is handed to it at a block, yield or exit point.

use std::cell::Cell;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Result};

pub mod scheduler;
pub mod fifo;

pub use self::fifo::WaitQueue;
pub use self::scheduler::{Scheduler, SchedulerStats};

/// Fiber ID type
pub type FiberId = u64;

/// Fiber IDs are unique across every scheduler in the process
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberId>> = const { Cell::new(None) };
}

/// Allocate a fresh fiber ID
pub(crate) fn alloc_fiber_id() -> FiberId {
    NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Get the fiber bound to the calling host thread
pub fn current_fiber() -> Option<FiberId> {
    CURRENT_FIBER.with(|current| current.get())
}

/// Bind (or unbind) the calling host thread to a fiber
pub(crate) fn bind_current(id: Option<FiberId>) {
    CURRENT_FIBER.with(|current| current.set(id));
}

/// Fiber states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Fiber is waiting in the run queue
    Ready,
    /// Fiber holds the CPU
    Running,
    /// Fiber is waiting on a queue, a join or a sleep
    Blocked,
    /// Fiber has finished execution
    Terminated,
}

/// Reason a blocked fiber resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by an explicit wakeup
    Woken,
    /// The wait's deadline expired first
    TimedOut,
}

impl WakeReason {
    /// Value reported across the hypercall boundary
    pub fn errno(self) -> i32 {
        match self {
            WakeReason::Woken => 0,
            WakeReason::TimedOut => libc::ETIMEDOUT,
        }
    }
}

/// Kernel execution context ("lwp") attached to a fiber
///
/// The value is opaque to the hypervisor: it is only compared and handed
/// back to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lwp(NonZeroUsize);

impl Lwp {
    /// Create an lwp from its address, `None` for null
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Lwp)
    }

    /// Create an lwp from a kernel pointer
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// Get the kernel pointer back
    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    /// Get the address of the lwp
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

/// Identity recorded as the owner of a lock
///
/// A fiber with an attached lwp is identified by it; a fiber without one
/// is identified by its fiber ID so that ownership is never ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    /// Fiber running on behalf of a kernel lwp
    Lwp(Lwp),
    /// Fiber running without an lwp
    Fiber(FiberId),
}

impl Holder {
    /// Get the lwp reported to the kernel for this holder
    pub fn lwp(self) -> Option<Lwp> {
        match self {
            Holder::Lwp(lwp) => Some(lwp),
            Holder::Fiber(_) => None,
        }
    }
}

/// Operations on the lwp binding of the current fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LwpOp {
    /// Kernel created an lwp (no-op)
    Create = 0,
    /// Kernel destroyed an lwp (no-op)
    Destroy = 1,
    /// Attach an lwp to the current fiber
    Set = 2,
    /// Detach the current fiber's lwp
    Clear = 3,
}

impl TryFrom<i32> for LwpOp {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(LwpOp::Create),
            1 => Ok(LwpOp::Destroy),
            2 => Ok(LwpOp::Set),
            3 => Ok(LwpOp::Clear),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Handle to a fiber, used for joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberHandle {
    id: FiberId,
}

impl FiberHandle {
    pub(crate) fn new(id: FiberId) -> Self {
        Self { id }
    }

    /// Get the fiber ID
    pub fn id(self) -> FiberId {
        self.id
    }

    /// Encode the handle as the opaque pointer handed to the kernel
    pub fn as_ptr(self) -> *mut c_void {
        self.id as usize as *mut c_void
    }

    /// Decode a handle previously produced by [`FiberHandle::as_ptr`]
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self::new(ptr as usize as FiberId))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, Some(LwpOp::Create))]
    #[test_case(1, Some(LwpOp::Destroy))]
    #[test_case(2, Some(LwpOp::Set))]
    #[test_case(3, Some(LwpOp::Clear))]
    #[test_case(4, None)]
    #[test_case(-1, None)]
    fn test_lwp_op_from_raw(raw: i32, expected: Option<LwpOp>) {
        assert_eq!(LwpOp::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_lwp_pointer_round_trip() {
        assert!(Lwp::from_ptr(std::ptr::null_mut()).is_none());
        let lwp = Lwp::new(0x1000).unwrap();
        assert_eq!(Lwp::from_ptr(lwp.as_ptr()), Some(lwp));
        assert_eq!(Holder::Lwp(lwp).lwp(), Some(lwp));
        assert_eq!(Holder::Fiber(7).lwp(), None);
    }

    #[test]
    fn test_fiber_handle_pointer() {
        let handle = FiberHandle::new(42);
        assert_eq!(FiberHandle::from_ptr(handle.as_ptr()), Some(handle));
        assert_eq!(FiberHandle::from_ptr(std::ptr::null_mut()), None);
    }

    #[test]
    fn test_wake_reason_errno() {
        assert_eq!(WakeReason::Woken.errno(), 0);
        assert_eq!(WakeReason::TimedOut.errno(), libc::ETIMEDOUT);
    }
}
