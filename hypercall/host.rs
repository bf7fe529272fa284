//! Clock, parameter and process hypercalls

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int, c_long};

use super::{hv, string};
use crate::core::process;
use crate::utils::console;
use crate::utils::time::{Clock, Timespec};
use crate::errno_of;

/// # Safety
///
/// `sec` and `nsec` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_clock_gettime(clock: c_int, sec: *mut i64, nsec: *mut c_long) -> c_int {
    let ts = match Clock::try_from(clock).and_then(|clock| hv().clock_gettime(clock)) {
        Ok(ts) => ts,
        Err(err) => return err.errno(),
    };
    *sec = ts.sec;
    *nsec = ts.nsec as c_long;
    0
}

#[no_mangle]
pub extern "C" fn rumpuser_clock_sleep(clock: c_int, sec: i64, nsec: c_long) -> c_int {
    let result = Clock::try_from(clock)
        .and_then(|clock| hv().clock_sleep(clock, Timespec::new(sec, nsec as i64)));
    errno_of(result)
}

/// # Safety
///
/// `name` must be a valid C string and `buf` valid for `blen` bytes.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_getparam(name: *const c_char, buf: *mut c_void, blen: usize) -> c_int {
    if buf.is_null() {
        return libc::EINVAL;
    }
    let name = match string(name) {
        Ok(name) => name,
        Err(err) => return err.errno(),
    };
    let buf = std::slice::from_raw_parts_mut(buf as *mut u8, blen);
    errno_of(hv().getparam(name, buf))
}

#[no_mangle]
pub extern "C" fn rumpuser_putchar(c: c_int) {
    console::print_char(c as u8);
}

#[no_mangle]
pub extern "C" fn rumpuser_exit(code: c_int) -> ! {
    process::exit(code)
}

#[no_mangle]
pub extern "C" fn rumpuser_seterrno(errno: c_int) {
    process::set_errno(errno);
}

/// Print a kernel debug message
///
/// Only the format text is printed; variadic arguments are not read.
///
/// # Safety
///
/// `fmt` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_dprintf(fmt: *const c_char) {
    if fmt.is_null() {
        return;
    }
    console::print_bytes(CStr::from_ptr(fmt).to_bytes());
}

#[no_mangle]
pub extern "C" fn rumpuser_kill(pid: i64, sig: c_int) -> c_int {
    process::kill(pid, sig);
    0
}

