//! Hypercall ABI exported to the rump kernel
//!
//! The `rumpuser_*` symbols the kernel links against. Raw integers from
//! the kernel are turned into closed enums here; everything past this
//! layer works on validated types. A contract violation in an entry point
//! that cannot report an error aborts the process.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, OnceLock};

use crate::config::HypervisorConfig;
use crate::core::sched::Scheduler;
use crate::core::vmm::{Hypervisor, VcpuToken, VirtualCpu};
use crate::utils::console;
use crate::{Error, Result, RUMPUSER_VERSION};

pub mod abi;
pub mod file;
pub mod host;
pub mod sync;
pub mod thread;

use self::abi::{HyperupVcpu, RumpuserHyperup};

/// The process-wide hypervisor context, installed by `rumpuser_init`
static HYPERVISOR: OnceLock<Hypervisor> = OnceLock::new();

/// Get the installed hypervisor context
pub fn hypervisor() -> Result<&'static Hypervisor> {
    HYPERVISOR.get().ok_or(Error::NotInitialized)
}

/// Get the installed context from an entry point that cannot fail
fn hv() -> &'static Hypervisor {
    match hypervisor() {
        Ok(hv) => hv,
        Err(err) => {
            console::print_fmt(format_args!("rumpuser: hypercall before rumpuser_init: {}\n", err));
            std::process::abort();
        }
    }
}

/// Dereference an object pointer handed back by the kernel
///
/// # Safety
///
/// `ptr` must be null or point to a live `T` for the lifetime `'a`.
unsafe fn object<'a, T>(ptr: *const T) -> &'a T {
    match ptr.as_ref() {
        Some(obj) => obj,
        None => panic!("null object passed to a hypercall"),
    }
}

/// Borrow a C string argument
///
/// # Safety
///
/// `ptr` must be null or a NUL-terminated string valid for `'a`.
unsafe fn string<'a>(ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument);
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| Error::InvalidArgument)
}

/// Set up the hypervisor and start the scheduler
///
/// Without a callback table the hypervisor runs its own virtual CPU.
pub fn init(version: i32, hyperup: Option<&RumpuserHyperup>) -> Result<&'static Hypervisor> {
    if version != RUMPUSER_VERSION {
        console::print_fmt(format_args!(
            "rumpuser version mismatch: kernel {}, hypervisor {}\n",
            version, RUMPUSER_VERSION
        ));
        std::process::abort();
    }

    if HYPERVISOR.get().is_some() {
        return Err(Error::ResourceBusy);
    }

    let config = HypervisorConfig::default();
    crate::utils::log::init(config.log_level);

    let sched = Scheduler::new();
    let vcpu: Arc<dyn VirtualCpu> = match hyperup {
        Some(hyp) => Arc::new(HyperupVcpu::new(*hyp)),
        None => Arc::new(VcpuToken::new(Arc::clone(&sched))),
    };
    let context = Hypervisor::new(config, sched, vcpu)?;
    if HYPERVISOR.set(context).is_err() {
        return Err(Error::ResourceBusy);
    }

    let installed = hv();
    installed.start();
    log::info!(
        "rumpuser interface version {} initialized on host {}",
        RUMPUSER_VERSION,
        installed.config().hostname
    );
    Ok(installed)
}

/// Initialize the hypercall layer
///
/// # Safety
///
/// `hyp` must be null or point to a valid callback table.
#[no_mangle]
pub unsafe extern "C" fn rumpuser_init(version: c_int, hyp: *const RumpuserHyperup) -> c_int {
    match init(version, hyp.as_ref()) {
        Ok(_) => 0,
        Err(err) => {
            log::warn!("rumpuser_init failed: {}", err);
            err.errno()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::abi::BiodoneFn;
    use super::file::*;
    use super::host::*;
    use super::sync::*;
    use super::thread::*;
    use super::*;
    use crate::core::sync::{MutexFlags, RumpCondvar, RumpMutex, RumpRwLock};
    use std::ffi::{c_void, CString};
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static BIO_CALLS: AtomicUsize = AtomicUsize::new(0);
    static BIO_LEN: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn biodone(arg: *mut c_void, len: usize, error: c_int) {
        assert_eq!(error, 0);
        assert_eq!(arg as usize, 0x77);
        BIO_CALLS.fetch_add(1, Ordering::SeqCst);
        BIO_LEN.store(len, Ordering::SeqCst);
    }

    unsafe extern "C" fn child(arg: *mut c_void) -> *mut c_void {
        let counter = &*(arg as *const AtomicUsize);
        counter.fetch_add(1, Ordering::SeqCst);
        ptr::null_mut()
    }

    // Everything touching the process-wide context lives in this one test:
    // the calling thread becomes the main fiber.
    #[test]
    fn test_hypercall_surface() {
        unsafe {
            assert_eq!(hypervisor().err(), Some(Error::NotInitialized));
            assert_eq!(rumpuser_init(RUMPUSER_VERSION, ptr::null()), 0);
            assert_eq!(rumpuser_init(RUMPUSER_VERSION, ptr::null()), libc::EBUSY);
            assert_eq!(hypervisor().unwrap().config().hostname, "rump");

            // Mutex, unknown flag bits dropped
            let mut mtx: *mut RumpMutex = ptr::null_mut();
            rumpuser_mutex_init(&mut mtx, 0x02 | 0x100);
            assert_eq!((*mtx).flags(), MutexFlags::KMUTEX);
            rumpuser_curlwpop(2, 0x5000 as *mut c_void);
            rumpuser_mutex_enter(mtx);
            assert_eq!(rumpuser_mutex_tryenter(mtx), 0);
            let mut owner: *mut c_void = ptr::null_mut();
            rumpuser_mutex_owner(mtx, &mut owner);
            assert_eq!(owner as usize, 0x5000);
            rumpuser_mutex_exit(mtx);
            rumpuser_mutex_exit(mtx);
            rumpuser_mutex_owner(mtx, &mut owner);
            assert!(owner.is_null());

            // Condition variable
            let mut cv: *mut RumpCondvar = ptr::null_mut();
            rumpuser_cv_init(&mut cv);
            rumpuser_mutex_enter(mtx);
            assert_eq!(rumpuser_cv_timedwait(cv, mtx, 0, 2_000_000), libc::ETIMEDOUT);
            let mut waiters: c_int = -1;
            rumpuser_cv_has_waiters(cv, &mut waiters);
            assert_eq!(waiters, 0);
            rumpuser_mutex_exit(mtx);
            rumpuser_cv_destroy(cv);
            rumpuser_mutex_destroy(mtx);

            // Reader-writer lock
            let mut rw: *mut RumpRwLock = ptr::null_mut();
            rumpuser_rw_init(&mut rw);
            rumpuser_rw_enter(1, rw);
            let mut held: c_int = 0;
            rumpuser_rw_held(1, rw, &mut held);
            assert_eq!(held, 1);
            assert_eq!(rumpuser_rw_tryenter(0, rw), libc::EBUSY);
            assert_eq!(rumpuser_rw_tryenter(5, rw), libc::EINVAL);
            rumpuser_rw_downgrade(rw);
            assert_eq!(rumpuser_rw_tryupgrade(rw), 0);
            rumpuser_rw_exit(rw);
            rumpuser_rw_destroy(rw);

            rumpuser_curlwpop(3, 0x5000 as *mut c_void);
            assert!(rumpuser_curlwp().is_null());

            // Threads
            let counter = AtomicUsize::new(0);
            let name = CString::new("worker").unwrap();
            let mut handle: *mut c_void = ptr::null_mut();
            let rv = rumpuser_thread_create(
                Some(child),
                &counter as *const AtomicUsize as *mut c_void,
                name.as_ptr(),
                1,
                0,
                -1,
                &mut handle,
            );
            assert_eq!(rv, 0);
            assert_eq!(rumpuser_thread_join(handle), 0);
            assert_eq!(counter.load(Ordering::SeqCst), 1);

            // Clock and parameters
            let (mut sec, mut nsec) = (0i64, 0 as std::os::raw::c_long);
            assert_eq!(rumpuser_clock_gettime(1, &mut sec, &mut nsec), 0);
            assert_eq!(rumpuser_clock_gettime(9, &mut sec, &mut nsec), libc::EINVAL);
            assert_eq!(rumpuser_clock_sleep(0, 0, 1_000_000), 0);

            let param = CString::new("_RUMPUSER_NCPU").unwrap();
            let mut buf = [0xffu8; 4];
            assert_eq!(rumpuser_getparam(param.as_ptr(), buf.as_mut_ptr() as *mut c_void, buf.len()), 0);
            assert_eq!(&buf, b"1\0\0\0");

            // Files
            let mut data = *b"hello, rump";
            assert_eq!(rumpfiber_fd_register(5, data.as_mut_ptr(), data.len(), 2), 0);
            let path = CString::new("5").unwrap();
            let (mut size, mut ft) = (0u64, -1);
            assert_eq!(rumpuser_getfileinfo(path.as_ptr(), &mut size, &mut ft), 0);
            assert_eq!((size, ft), (11, 2));

            let mut out = [0u8; 4];
            rumpuser_bio(
                5,
                1,
                out.as_mut_ptr() as *mut c_void,
                out.len(),
                7,
                Some(biodone as BiodoneFn),
                0x77 as *mut c_void,
            );
            assert_eq!(BIO_CALLS.load(Ordering::SeqCst), 1);
            assert_eq!(BIO_LEN.load(Ordering::SeqCst), 4);
            assert_eq!(&out, b"rump");

            // Writes land in the registered memory
            let mut patch = *b"RUMP";
            let iov = [abi::RumpuserIovec {
                iov_base: patch.as_mut_ptr() as *mut c_void,
                iov_len: patch.len(),
            }];
            let mut written = 0usize;
            assert_eq!(rumpuser_iovwrite(5, iov.as_ptr(), iov.len(), 7, &mut written), 0);
            assert_eq!(written, 4);
            assert_eq!(rumpfiber_fd_unregister(5), 0);
            assert_eq!(&data, b"hello, RUMP");
        }
    }
}
