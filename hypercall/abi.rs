//! C types of the `rumpuser` hypercall interface
//!
//! Layouts match `rump/rumpuser.h` for interface version 17.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_long};
use std::ptr;

use crate::core::sync::RumpMutex;
use crate::core::vmm::vcpu::{Nesting, VirtualCpu};

/// Callback the kernel passes to `rumpuser_bio`
pub type BiodoneFn = unsafe extern "C" fn(arg: *mut c_void, len: usize, error: c_int);

/// Entry point of a thread created by `rumpuser_thread_create`
pub type ThreadFn = unsafe extern "C" fn(arg: *mut c_void) -> *mut c_void;

/// Upcalls into the kernel, handed over by `rumpuser_init`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RumpuserHyperup {
    pub hyp_schedule: Option<unsafe extern "C" fn()>,
    pub hyp_unschedule: Option<unsafe extern "C" fn()>,
    pub hyp_backend_unschedule: Option<unsafe extern "C" fn(c_int, *mut c_int, *mut c_void)>,
    pub hyp_backend_schedule: Option<unsafe extern "C" fn(c_int, *mut c_void)>,
    pub hyp_lwproc_switch: Option<unsafe extern "C" fn(*mut c_void)>,
    pub hyp_lwproc_release: Option<unsafe extern "C" fn()>,
    pub hyp_lwproc_rfork: Option<unsafe extern "C" fn(*mut c_void, c_int, *const c_char) -> c_int>,
    pub hyp_lwproc_newlwp: Option<unsafe extern "C" fn(c_int) -> c_int>,
    pub hyp_lwproc_curlwp: Option<unsafe extern "C" fn() -> *mut c_void>,
    pub hyp_syscall: Option<unsafe extern "C" fn(c_int, *mut c_void, *mut c_long) -> c_int>,
    pub hyp_lwpexit: Option<unsafe extern "C" fn()>,
    pub hyp_execnotify: Option<unsafe extern "C" fn(*const c_char)>,
    pub hyp_getpid: Option<unsafe extern "C" fn() -> c_int>,
    pub hyp_extra: [*mut c_void; 8],
}

/// One segment of a vectored transfer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RumpuserIovec {
    pub iov_base: *mut c_void,
    pub iov_len: usize,
}

impl RumpuserIovec {
    /// View the segment as a byte slice
    ///
    /// # Safety
    ///
    /// `iov_base` must be valid for `iov_len` bytes for the lifetime `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.iov_len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.iov_base as *const u8, self.iov_len)
        }
    }

    /// View the segment as a mutable byte slice
    ///
    /// # Safety
    ///
    /// As for [`RumpuserIovec::as_slice`], and no other reference to the
    /// segment may exist for `'a`.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.iov_len == 0 {
            &mut []
        } else {
            std::slice::from_raw_parts_mut(self.iov_base as *mut u8, self.iov_len)
        }
    }
}

/// Virtual CPU owned by the kernel, reached through its upcalls
pub struct HyperupVcpu {
    hyp: RumpuserHyperup,
}

// SAFETY: the table is an immutable copy of function pointers; the spare
// pointers in `hyp_extra` are never dereferenced.
unsafe impl Send for HyperupVcpu {}
unsafe impl Sync for HyperupVcpu {}

impl HyperupVcpu {
    pub fn new(hyp: RumpuserHyperup) -> Self {
        Self { hyp }
    }
}

fn interlock_ptr(interlock: Option<&RumpMutex>) -> *mut c_void {
    interlock.map_or(ptr::null_mut(), |mtx| mtx as *const RumpMutex as *mut c_void)
}

impl VirtualCpu for HyperupVcpu {
    fn release(&self, interlock: Option<&RumpMutex>) -> Nesting {
        let mut nlocks: c_int = 0;
        if let Some(unschedule) = self.hyp.hyp_backend_unschedule {
            // SAFETY: upcall installed by the kernel; `nlocks` outlives it.
            unsafe { unschedule(0, &mut nlocks, interlock_ptr(interlock)) };
        }
        Nesting(nlocks)
    }

    fn reacquire(&self, nesting: Nesting, interlock: Option<&RumpMutex>) {
        if let Some(schedule) = self.hyp.hyp_backend_schedule {
            // SAFETY: upcall installed by the kernel.
            unsafe { schedule(nesting.0, interlock_ptr(interlock)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sync::MutexFlags;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    static RESTORED: AtomicI32 = AtomicI32::new(0);
    static INTERLOCK: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn backend_unschedule(_nlocks: c_int, countp: *mut c_int, interlock: *mut c_void) {
        *countp = 2;
        INTERLOCK.store(interlock as usize, Ordering::SeqCst);
    }

    unsafe extern "C" fn backend_schedule(nlocks: c_int, _interlock: *mut c_void) {
        RESTORED.store(nlocks, Ordering::SeqCst);
    }

    fn hyperup() -> RumpuserHyperup {
        RumpuserHyperup {
            hyp_schedule: None,
            hyp_unschedule: None,
            hyp_backend_unschedule: Some(backend_unschedule),
            hyp_backend_schedule: Some(backend_schedule),
            hyp_lwproc_switch: None,
            hyp_lwproc_release: None,
            hyp_lwproc_rfork: None,
            hyp_lwproc_newlwp: None,
            hyp_lwproc_curlwp: None,
            hyp_syscall: None,
            hyp_lwpexit: None,
            hyp_execnotify: None,
            hyp_getpid: None,
            hyp_extra: [ptr::null_mut(); 8],
        }
    }

    #[test]
    fn test_hyperup_vcpu_forwards_to_kernel() {
        let vcpu = HyperupVcpu::new(hyperup());
        let mtx = RumpMutex::new(MutexFlags::KMUTEX);

        let nesting = vcpu.release(Some(&mtx));
        assert_eq!(nesting, Nesting(2));
        assert_eq!(INTERLOCK.load(Ordering::SeqCst), &mtx as *const RumpMutex as usize);

        vcpu.reacquire(nesting, None);
        assert_eq!(RESTORED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_iovec_slices() {
        let mut buf = *b"abcd";
        let iov = RumpuserIovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: 3,
        };
        assert_eq!(unsafe { iov.as_slice() }, b"abc");

        let empty = RumpuserIovec {
            iov_base: ptr::null_mut(),
            iov_len: 0,
        };
        assert!(unsafe { empty.as_mut_slice() }.is_empty());
    }

    #[test]
    fn test_hyperup_layout() {
        let pointer = std::mem::size_of::<*mut c_void>();
        assert_eq!(std::mem::size_of::<RumpuserHyperup>(), (13 + 8) * pointer);
    }
}
