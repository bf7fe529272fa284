//! Utility functions
//!
//! This module contains the console, the logger and the clock helpers
//! used throughout the hypervisor.

pub mod log;
pub mod console;
pub mod time;

/// Get the errno left behind by the last failed host call
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}
