//! rumpfiber - cooperative fiber hypercall layer
//!
//! This is the main library for rumpfiber, the hypervisor layer that lets a
//! rump kernel run as cooperatively scheduled fibers on a single virtual
//! CPU. It provides the kernel's locking primitives, the virtual CPU
//! scheduling handshake, thread identity binding and the `rumpuser_*`
//! hypercall ABI.

// Core modules
pub mod utils;
pub mod config;

// Core hypervisor modules
pub mod core;

// Device drivers
pub mod drivers;

// Hypercall ABI exported to the rump kernel
pub mod hypercall;

// Re-export key types for convenience
pub use crate::config::HypervisorConfig;
pub use crate::core::sched::{FiberHandle, FiberId, Holder, Lwp, LwpOp, Scheduler, WaitQueue, WakeReason};
pub use crate::core::sync::{MutexFlags, RumpCondvar, RumpMutex, RumpRwLock, RwMode};
pub use crate::core::vmm::vcpu::{Cpu, Nesting, VcpuToken, VirtualCpu};
pub use crate::core::vmm::Hypervisor;

use std::fmt;

/// rumpfiber version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hypercall interface version the rump kernel must be built against
pub const RUMPUSER_VERSION: i32 = 17;

/// Common error type for rumpfiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument,
    /// Not found
    NotFound,
    /// Resource busy
    ResourceBusy,
    /// Resource unavailable
    ResourceUnavailable,
    /// Not initialized
    NotInitialized,
    /// Invalid state
    InvalidState,
    /// Host call failed with the given errno
    Host(i32),
    /// Driver error
    DriverError(drivers::Error),
}

impl Error {
    /// Host errno value reported across the hypercall boundary
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::NotFound => libc::ENOENT,
            Error::ResourceBusy => libc::EBUSY,
            Error::ResourceUnavailable => libc::EAGAIN,
            Error::NotInitialized => libc::ENXIO,
            Error::InvalidState => libc::EINVAL,
            Error::Host(errno) => errno,
            Error::DriverError(err) => err.errno(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "not found"),
            Error::ResourceBusy => write!(f, "resource busy"),
            Error::ResourceUnavailable => write!(f, "resource unavailable"),
            Error::NotInitialized => write!(f, "not initialized"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::Host(errno) => write!(f, "host error {}", errno),
            Error::DriverError(err) => write!(f, "driver error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<drivers::Error> for Error {
    fn from(err: drivers::Error) -> Self {
        Error::DriverError(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Convert a `Result` into the zero-or-errno convention of the hypercall ABI
pub(crate) fn errno_of(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Error::InvalidArgument, libc::EINVAL; "invalid argument")]
    #[test_case(Error::NotFound, libc::ENOENT; "not found")]
    #[test_case(Error::ResourceBusy, libc::EBUSY; "busy")]
    #[test_case(Error::NotInitialized, libc::ENXIO; "not initialized")]
    #[test_case(Error::Host(libc::EIO), libc::EIO; "host passthrough")]
    #[test_case(Error::DriverError(drivers::Error::BadDescriptor), libc::EBADF; "bad descriptor")]
    fn test_errno_mapping(err: Error, errno: i32) {
        assert_eq!(err.errno(), errno);
    }

    #[test]
    fn test_errno_of() {
        assert_eq!(errno_of(Ok(())), 0);
        assert_eq!(errno_of(Err(Error::ResourceBusy)), libc::EBUSY);
    }
}
