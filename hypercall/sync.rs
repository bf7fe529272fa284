//! Locking hypercalls
//!
//! Mutexes, reader-writer locks and condition variables are boxed and
//! handed to the kernel as opaque pointers; `*_destroy` takes the box back.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::time::Duration;

use super::{hv, object};
use crate::core::sched::{Lwp, WakeReason};
use crate::core::sync::{MutexFlags, RumpCondvar, RumpMutex, RumpRwLock, RwMode};
use crate::errno_of;
use crate::utils::time::Timespec;

/// Decode a lock mode passed by the kernel
fn rw_mode(raw: c_int) -> Option<RwMode> {
    match RwMode::try_from(raw) {
        Ok(mode) => Some(mode),
        Err(_) => {
            log::warn!("invalid rwlock mode {}", raw);
            None
        }
    }
}

/// Relative wait timeout from the kernel's seconds and nanoseconds
fn timeout_of(sec: i64, nsec: i64) -> Duration {
    Duration::from_millis(Timespec::new(sec, nsec).as_millis())
}

fn lwp_ptr(lwp: Option<Lwp>) -> *mut c_void {
    lwp.map_or(std::ptr::null_mut(), Lwp::as_ptr)
}

/// # Safety
///
/// `mtxp` must be valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_init(mtxp: *mut *mut RumpMutex, flags: c_int) {
    let known = MutexFlags::from_bits_truncate(flags);
    if known.bits() != flags {
        log::warn!("ignoring unknown mutex flags {:#x}", flags & !MutexFlags::all().bits());
    }
    *mtxp = Box::into_raw(Box::new(RumpMutex::new(known)));
}

/// # Safety
///
/// `mtx` must come from [`rumpuser_mutex_init`] and not be destroyed.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_enter(mtx: *mut RumpMutex) {
    object(mtx).enter(&hv().cpu());
}

/// # Safety
///
/// As for [`rumpuser_mutex_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_enter_nowrap(mtx: *mut RumpMutex) {
    object(mtx).enter_no_yield(hv().sched());
}

/// # Safety
///
/// As for [`rumpuser_mutex_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_tryenter(mtx: *mut RumpMutex) -> c_int {
    errno_of(object(mtx).try_enter(hv().sched()))
}

/// # Safety
///
/// As for [`rumpuser_mutex_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_exit(mtx: *mut RumpMutex) {
    object(mtx).exit(hv().sched());
}

/// # Safety
///
/// `mtx` must come from [`rumpuser_mutex_init`]; it is freed here.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_destroy(mtx: *mut RumpMutex) {
    if !mtx.is_null() {
        Box::from_raw(mtx).destroy();
    }
}

/// # Safety
///
/// As for [`rumpuser_mutex_enter`]; `lp` must be valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_mutex_owner(mtx: *mut RumpMutex, lp: *mut *mut c_void) {
    *lp = lwp_ptr(object(mtx).owner());
}

/// # Safety
///
/// `rwp` must be valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_init(rwp: *mut *mut RumpRwLock) {
    *rwp = Box::into_raw(Box::new(RumpRwLock::new()));
}

/// # Safety
///
/// `rw` must come from [`rumpuser_rw_init`] and not be destroyed.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_enter(mode: c_int, rw: *mut RumpRwLock) {
    match rw_mode(mode) {
        Some(mode) => object(rw).enter(&hv().cpu(), mode),
        None => panic!("rwlock entered with an invalid mode"),
    }
}

/// # Safety
///
/// As for [`rumpuser_rw_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_tryenter(mode: c_int, rw: *mut RumpRwLock) -> c_int {
    match rw_mode(mode) {
        Some(mode) => errno_of(object(rw).try_enter(hv().sched(), mode)),
        None => libc::EINVAL,
    }
}

/// # Safety
///
/// As for [`rumpuser_rw_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_exit(rw: *mut RumpRwLock) {
    object(rw).exit(hv().sched());
}

/// # Safety
///
/// `rw` must come from [`rumpuser_rw_init`]; it is freed here.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_destroy(rw: *mut RumpRwLock) {
    if !rw.is_null() {
        Box::from_raw(rw).destroy();
    }
}

/// # Safety
///
/// As for [`rumpuser_rw_enter`]; `heldp` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_held(mode: c_int, rw: *mut RumpRwLock, heldp: *mut c_int) {
    let held = match rw_mode(mode) {
        Some(mode) => object(rw).is_held(hv().sched(), mode),
        None => false,
    };
    *heldp = held as c_int;
}

/// # Safety
///
/// As for [`rumpuser_rw_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_downgrade(rw: *mut RumpRwLock) {
    object(rw).downgrade(hv().sched());
}

/// # Safety
///
/// As for [`rumpuser_rw_enter`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_rw_tryupgrade(rw: *mut RumpRwLock) -> c_int {
    errno_of(object(rw).try_upgrade(hv().sched()))
}

/// # Safety
///
/// `cvp` must be valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_init(cvp: *mut *mut RumpCondvar) {
    *cvp = Box::into_raw(Box::new(RumpCondvar::new()));
}

/// # Safety
///
/// `cv` must come from [`rumpuser_cv_init`]; it is freed here.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_destroy(cv: *mut RumpCondvar) {
    if !cv.is_null() {
        Box::from_raw(cv).destroy();
    }
}

/// # Safety
///
/// `cv` and `mtx` must be live objects from their `*_init` calls and the
/// caller must hold `mtx`.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_wait(cv: *mut RumpCondvar, mtx: *mut RumpMutex) {
    object(cv).wait(&hv().cpu(), object(mtx));
}

/// # Safety
///
/// As for [`rumpuser_cv_wait`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_wait_nowrap(cv: *mut RumpCondvar, mtx: *mut RumpMutex) {
    object(cv).wait_no_yield(hv().sched(), object(mtx));
}

/// Wait with a relative timeout, returning `ETIMEDOUT` if it expired
///
/// # Safety
///
/// As for [`rumpuser_cv_wait`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_timedwait(
    cv: *mut RumpCondvar,
    mtx: *mut RumpMutex,
    sec: i64,
    nsec: i64,
) -> c_int {
    match object(cv).timed_wait(&hv().cpu(), object(mtx), timeout_of(sec, nsec)) {
        WakeReason::Woken => 0,
        reason => reason.errno(),
    }
}

/// # Safety
///
/// `cv` must come from [`rumpuser_cv_init`] and not be destroyed.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_signal(cv: *mut RumpCondvar) {
    object(cv).signal(hv().sched());
}

/// # Safety
///
/// As for [`rumpuser_cv_signal`].
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_broadcast(cv: *mut RumpCondvar) {
    object(cv).broadcast(hv().sched());
}

/// # Safety
///
/// As for [`rumpuser_cv_signal`]; `nwaiters` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_cv_has_waiters(cv: *mut RumpCondvar, nwaiters: *mut c_int) {
    *nwaiters = object(cv).has_waiters() as c_int;
}
