//! Device drivers module
//!
//! This module provides the devices the rump kernel reaches through the
//! file and block I/O hypercalls. The only backend is the in-memory
//! descriptor table in [`block`].

use std::fmt;

pub mod block;

pub use self::block::{BioOp, Descriptor, FdTable, FileType, OpenFlags, MAX_FDS};

/// Driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No descriptor registered under that index
    BadDescriptor,
    /// Path does not name a registered descriptor
    NoSuchFile,
    /// Index already registered
    AlreadyRegistered,
    /// Descriptor table full
    TableFull,
    /// Offset outside the addressable range
    BadOffset,
}

impl Error {
    /// Host errno value for this error
    pub fn errno(self) -> i32 {
        match self {
            Error::BadDescriptor => libc::EBADF,
            Error::NoSuchFile => libc::ENOENT,
            Error::AlreadyRegistered => libc::EEXIST,
            Error::TableFull => libc::EMFILE,
            Error::BadOffset => libc::EINVAL,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadDescriptor => write!(f, "bad descriptor"),
            Error::NoSuchFile => write!(f, "no such file"),
            Error::AlreadyRegistered => write!(f, "descriptor already registered"),
            Error::TableFull => write!(f, "descriptor table full"),
            Error::BadOffset => write!(f, "bad offset"),
        }
    }
}

impl std::error::Error for Error {}
