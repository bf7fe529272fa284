//! Process control
//!
//! Exiting the host process, setting the host thread's errno and
//! delivering kernel signals to the host process.

use cfg_if::cfg_if;

/// Exit code asking for an abnormal termination
pub const RUMPUSER_PANIC: i32 = -1;

/// Terminate the host process
///
/// [`RUMPUSER_PANIC`] aborts; any other code is a normal exit.
pub fn exit(code: i32) -> ! {
    if code == RUMPUSER_PANIC {
        log::error!("rump kernel panicked, aborting");
        log::logger().flush();
        std::process::abort();
    }

    log::info!("rump kernel exiting with status {}", code);
    log::logger().flush();
    std::process::exit(code)
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    } else if #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno()
        }
    } else {
        compile_error!("no errno location known for this host");
    }
}

/// Set the calling host thread's errno
pub fn set_errno(errno: i32) {
    // SAFETY: the errno location is valid and thread-local for the
    // lifetime of the calling thread.
    unsafe {
        *errno_location() = errno;
    }
}

cfg_if! {
    if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))] {
        const HOST_SIGEMT: Option<i32> = Some(libc::SIGEMT);
        const HOST_SIGINFO: Option<i32> = Some(libc::SIGINFO);
        const HOST_SIGPWR: Option<i32> = None;
    } else {
        const HOST_SIGEMT: Option<i32> = None;
        const HOST_SIGINFO: Option<i32> = None;
        const HOST_SIGPWR: Option<i32> = Some(libc::SIGPWR);
    }
}

/// Map a kernel (NetBSD-numbered) signal to the host's number
pub fn host_signal(rumpsig: i32) -> Option<i32> {
    let sig = match rumpsig {
        1 => libc::SIGHUP,
        2 => libc::SIGINT,
        3 => libc::SIGQUIT,
        4 => libc::SIGILL,
        5 => libc::SIGTRAP,
        6 => libc::SIGABRT,
        7 => return HOST_SIGEMT,
        8 => libc::SIGFPE,
        9 => libc::SIGKILL,
        10 => libc::SIGBUS,
        11 => libc::SIGSEGV,
        12 => libc::SIGSYS,
        13 => libc::SIGPIPE,
        14 => libc::SIGALRM,
        15 => libc::SIGTERM,
        16 => libc::SIGURG,
        17 => libc::SIGSTOP,
        18 => libc::SIGTSTP,
        19 => libc::SIGCONT,
        20 => libc::SIGCHLD,
        21 => libc::SIGTTIN,
        22 => libc::SIGTTOU,
        23 => libc::SIGIO,
        24 => libc::SIGXCPU,
        25 => libc::SIGXFSZ,
        26 => libc::SIGVTALRM,
        27 => libc::SIGPROF,
        28 => libc::SIGWINCH,
        29 => return HOST_SIGINFO,
        30 => libc::SIGUSR1,
        31 => libc::SIGUSR2,
        32 => return HOST_SIGPWR,
        _ => return None,
    };
    Some(sig)
}

/// Deliver a kernel signal to the host process
///
/// The target pid is not used: the signal is raised synchronously in the
/// calling thread. Signals without a host equivalent are dropped.
pub fn kill(pid: i64, rumpsig: i32) {
    match host_signal(rumpsig) {
        Some(sig) => {
            log::debug!("raising host signal {} for kernel signal {} (pid {})", sig, rumpsig, pid);
            // SAFETY: raise has no memory-safety preconditions.
            unsafe {
                libc::raise(sig);
            }
        }
        None => log::debug!("kernel signal {} has no host equivalent, dropped", rumpsig),
    }
}
