//! File and block I/O hypercalls
//!
//! Descriptors index the in-memory table of the installed context.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::ptr::NonNull;

use super::abi::{BiodoneFn, RumpuserIovec};
use super::{hv, string};
use crate::drivers::block::{BioOp, Descriptor, FileType, OpenFlags};
use crate::drivers::Error as DriverError;
use crate::{errno_of, Error, Result};

fn descriptor(fd: c_int) -> Result<usize> {
    usize::try_from(fd).map_err(|_| DriverError::BadDescriptor.into())
}

/// Register `len` bytes at `data` as descriptor `fd`
///
/// The region is mapped, not copied: kernel writes land in it.
///
/// # Safety
///
/// `data` must be valid for reads and writes of `len` bytes until the
/// descriptor is unregistered, and must not be accessed by the caller in
/// the meantime.
#[no_mangle]
pub unsafe extern "C" fn rumpfiber_fd_register(fd: c_int, data: *mut u8, len: usize, ft: c_int) -> c_int {
    let result = (|| -> Result<()> {
        let fd = descriptor(fd)?;
        let file_type = FileType::try_from(ft)?;
        let base = match NonNull::new(data) {
            Some(base) => base,
            None if len == 0 => NonNull::dangling(),
            None => return Err(Error::InvalidArgument),
        };
        hv().fds().register(fd, Descriptor::mapped(base, len, file_type))
    })();
    errno_of(result)
}

#[no_mangle]
pub extern "C" fn rumpfiber_fd_unregister(fd: c_int) -> c_int {
    errno_of(descriptor(fd).and_then(|fd| hv().fds().unregister(fd).map(|_| ())))
}

/// # Safety
///
/// `path` must be a valid C string; `sizep` and `ftp` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_getfileinfo(path: *const c_char, sizep: *mut u64, ftp: *mut c_int) -> c_int {
    let info = string(path).and_then(|path| hv().fds().getfileinfo(path));
    match info {
        Ok((size, file_type)) => {
            if !sizep.is_null() {
                *sizep = size;
            }
            if !ftp.is_null() {
                *ftp = file_type as c_int;
            }
            0
        }
        Err(err) => err.errno(),
    }
}

/// # Safety
///
/// `path` must be a valid C string; `fdp` valid for a write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_open(path: *const c_char, flags: c_int, fdp: *mut c_int) -> c_int {
    let flags = OpenFlags::from_bits_truncate(flags);
    match string(path).and_then(|path| hv().fds().open(path, flags)) {
        Ok(fd) => {
            *fdp = fd as c_int;
            0
        }
        Err(err) => err.errno(),
    }
}

#[no_mangle]
pub extern "C" fn rumpuser_close(fd: c_int) -> c_int {
    errno_of(descriptor(fd).and_then(|fd| hv().fds().close(fd)))
}

/// Borrow the kernel's iovec array
///
/// # Safety
///
/// `iov` must be valid for `iovlen` entries.
unsafe fn iovecs<'a>(iov: *const RumpuserIovec, iovlen: usize) -> &'a [RumpuserIovec] {
    if iovlen == 0 || iov.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(iov, iovlen)
    }
}

/// # Safety
///
/// Every segment of `iov` must be writable; `retv` valid for a write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_iovread(
    fd: c_int,
    iov: *const RumpuserIovec,
    iovlen: usize,
    off: i64,
    retv: *mut usize,
) -> c_int {
    let mut bufs: Vec<&mut [u8]> = iovecs(iov, iovlen).iter().map(|seg| seg.as_mut_slice()).collect();
    match descriptor(fd).and_then(|fd| hv().fds().iovread(fd, &mut bufs, off)) {
        Ok(done) => {
            *retv = done;
            0
        }
        Err(err) => err.errno(),
    }
}

/// # Safety
///
/// Every segment of `iov` must be readable; `retv` valid for a write.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_iovwrite(
    fd: c_int,
    iov: *const RumpuserIovec,
    iovlen: usize,
    off: i64,
    retv: *mut usize,
) -> c_int {
    let bufs: Vec<&[u8]> = iovecs(iov, iovlen).iter().map(|seg| seg.as_slice()).collect();
    match descriptor(fd).and_then(|fd| hv().fds().iovwrite(fd, &bufs, off)) {
        Ok(done) => {
            *retv = done;
            0
        }
        Err(err) => err.errno(),
    }
}

#[no_mangle]
pub extern "C" fn rumpuser_syncfd(fd: c_int, flags: c_int, start: u64, len: u64) -> c_int {
    errno_of(descriptor(fd).and_then(|fd| hv().fds().syncfd(fd, flags, start, len)))
}

/// Block transfer, completed through `biodone` before returning
///
/// # Safety
///
/// `data` must be valid for `dlen` bytes; `biodone` must accept `bioarg`.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_bio(
    fd: c_int,
    op: c_int,
    data: *mut c_void,
    dlen: usize,
    off: i64,
    biodone: Option<BiodoneFn>,
    bioarg: *mut c_void,
) {
    let done = |len: usize, error: i32| {
        if let Some(biodone) = biodone {
            // SAFETY: the kernel's completion callback for `bioarg`.
            unsafe { biodone(bioarg, len, error) };
        }
    };

    let fd = match descriptor(fd) {
        Ok(fd) => fd,
        Err(err) => return done(0, err.errno()),
    };
    let buf: &mut [u8] = if dlen == 0 || data.is_null() {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(data as *mut u8, dlen)
    };
    hv().fds().bio(fd, BioOp::from_bits_truncate(op), buf, off, done);
}
