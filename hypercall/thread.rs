//! Thread and lwp hypercalls

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};

use super::abi::ThreadFn;
use super::{hv, string};
use crate::core::sched::{FiberHandle, Lwp, LwpOp};

/// Kernel argument carried into a new fiber
struct ThreadArg(*mut c_void);

// SAFETY: the pointer is only handed back to the kernel's own entry point,
// which runs on one fiber at a time.
unsafe impl Send for ThreadArg {}

/// Create a fiber running a kernel thread
///
/// Priority and CPU index are accepted and ignored.
///
/// # Safety
///
/// `name` must be a valid C string; `ptcookie` must be valid for a pointer
/// write when `joinable` is nonzero.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_thread_create(
    entry: Option<ThreadFn>,
    arg: *mut c_void,
    name: *const c_char,
    joinable: c_int,
    _pri: c_int,
    _cpuidx: c_int,
    ptcookie: *mut *mut c_void,
) -> c_int {
    let Some(entry) = entry else {
        return libc::EINVAL;
    };
    let name = string(name).unwrap_or("rumpthread");
    let arg = ThreadArg(arg);

    let spawned = hv().thread_create(name, joinable != 0, move || {
        let arg = arg;
        // SAFETY: the kernel guarantees `entry` accepts `arg`.
        unsafe {
            entry(arg.0);
        }
    });

    match spawned {
        Ok(handle) => {
            if joinable != 0 && !ptcookie.is_null() {
                *ptcookie = handle.as_ptr();
            }
            0
        }
        Err(err) => {
            log::warn!("failed to create thread {}: {}", name, err);
            err.errno()
        }
    }
}

#[no_mangle]
pub extern "C" fn rumpuser_thread_exit() -> ! {
    hv().thread_exit()
}

/// # Safety
///
/// `ptcookie` must come from a joinable [`rumpuser_thread_create`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_thread_join(ptcookie: *mut c_void) -> c_int {
    match FiberHandle::from_ptr(ptcookie) {
        Some(handle) => crate::errno_of(hv().thread_join(handle)),
        None => libc::EINVAL,
    }
}

/// # Safety
///
/// `lwp` is opaque; it is only stored and compared.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_curlwpop(op: c_int, lwp: *mut c_void) {
    match LwpOp::try_from(op) {
        Ok(op) => hv().curlwpop(op, Lwp::from_ptr(lwp)),
        Err(_) => panic!("invalid lwp operation {}", op),
    }
}

#[no_mangle]
pub extern "C" fn rumpuser_curlwp() -> *mut c_void {
    hv().curlwp().map_or(std::ptr::null_mut(), Lwp::as_ptr)
}
