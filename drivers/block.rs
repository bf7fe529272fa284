//! Descriptor-backed file and block I/O
//!
//! The rump kernel sees host "files" as small integer descriptors, each
//! backed by a memory region registered up front by the embedding program.
//! A region is either owned by the table or mapped from the caller, in
//! which case writes land in the caller's memory.
//! Paths handed to `open`/`getfileinfo` are the decimal descriptor index.
//! Transfers are clipped to the region; nothing ever grows it.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;
use heapless::FnvIndexMap;
use parking_lot::{Mutex, RwLock};

use super::Error;
use crate::Result;

/// Capacity of the descriptor table
pub const MAX_FDS: usize = 64;

/// Offset value meaning "no seek" in vectored I/O
pub const IOV_NOSEEK: i64 = -1;

/// File types reported by `getfileinfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FileType {
    Other = 0,
    Dir = 1,
    Reg = 2,
    Blk = 3,
    Chr = 4,
}

impl TryFrom<i32> for FileType {
    type Error = crate::Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(FileType::Other),
            1 => Ok(FileType::Dir),
            2 => Ok(FileType::Reg),
            3 => Ok(FileType::Blk),
            4 => Ok(FileType::Chr),
            _ => Err(crate::Error::InvalidArgument),
        }
    }
}

bitflags! {
    /// Open flags; read-only is the empty set
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const WRONLY = 0x01;
        const RDWR = 0x02;
        const CREATE = 0x04;
        const EXCL = 0x08;
        const BIO = 0x10;
    }
}

bitflags! {
    /// Block I/O operation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BioOp: i32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const SYNC = 0x04;
    }
}

/// Backing memory of a descriptor
#[derive(Debug)]
enum Region {
    Owned(Box<[u8]>),
    Mapped { base: NonNull<u8>, len: usize },
}

// SAFETY: a mapped region is only touched under the descriptor's lock, and
// the registration contract keeps the memory alive while registered.
unsafe impl Send for Region {}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Region::Owned(data) => data,
            // SAFETY: `base` is valid for `len` bytes per `Descriptor::mapped`.
            Region::Mapped { base, len } => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), *len)
            },
        }
    }
}

impl DerefMut for Region {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Region::Owned(data) => data,
            // SAFETY: as above, and the lock makes this the only access.
            Region::Mapped { base, len } => unsafe {
                std::slice::from_raw_parts_mut(base.as_ptr(), *len)
            },
        }
    }
}

/// Memory region registered as a descriptor
#[derive(Debug)]
pub struct Descriptor {
    file_type: FileType,
    data: Mutex<Region>,
}

impl Descriptor {
    /// Wrap `data` as a descriptor of type `file_type`
    pub fn new(data: impl Into<Box<[u8]>>, file_type: FileType) -> Self {
        Self {
            file_type,
            data: Mutex::new(Region::Owned(data.into())),
        }
    }

    /// Map `len` bytes of caller memory at `base` as a descriptor
    ///
    /// Transfers read and write the memory in place.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes until the
    /// descriptor is unregistered and dropped, and nothing else may access
    /// the memory meanwhile.
    pub unsafe fn mapped(base: NonNull<u8>, len: usize, file_type: FileType) -> Self {
        Self {
            file_type,
            data: Mutex::new(Region::Mapped { base, len }),
        }
    }

    /// Get the file type
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Get the region size in bytes
    pub fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    /// Copy the region's current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().to_vec()
    }
}

/// Resolve a transfer offset against a region of `size` bytes
///
/// Returns `None` when the offset lies past the end.
fn start_of(offset: i64, size: usize) -> Result<Option<usize>> {
    let offset = match offset {
        IOV_NOSEEK => 0,
        offset if offset < 0 => return Err(Error::BadOffset.into()),
        offset => offset as u64,
    };

    if offset > size as u64 {
        Ok(None)
    } else {
        Ok(Some(offset as usize))
    }
}

/// Table of registered descriptors
#[derive(Default)]
pub struct FdTable {
    fds: RwLock<FnvIndexMap<usize, Arc<Descriptor>, MAX_FDS>>,
}

impl FdTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `desc` under index `fd`
    pub fn register(&self, fd: usize, desc: Descriptor) -> Result<()> {
        if fd >= MAX_FDS {
            return Err(Error::BadDescriptor.into());
        }

        let mut fds = self.fds.write();
        if fds.contains_key(&fd) {
            return Err(Error::AlreadyRegistered.into());
        }
        let size = desc.size();
        let file_type = desc.file_type();
        fds.insert(fd, Arc::new(desc))
            .map_err(|_| Error::TableFull)?;

        log::debug!("registered descriptor {} ({:?}, {} bytes)", fd, file_type, size);
        Ok(())
    }

    /// Remove the descriptor registered under `fd`
    pub fn unregister(&self, fd: usize) -> Result<Arc<Descriptor>> {
        let desc = self.fds.write().remove(&fd).ok_or(Error::BadDescriptor)?;
        log::debug!("unregistered descriptor {}", fd);
        Ok(desc)
    }

    /// Get the descriptor registered under `fd`
    pub fn get(&self, fd: usize) -> Result<Arc<Descriptor>> {
        self.fds
            .read()
            .get(&fd)
            .cloned()
            .ok_or_else(|| Error::BadDescriptor.into())
    }

    /// Get the number of registered descriptors
    pub fn len(&self) -> usize {
        self.fds.read().len()
    }

    /// Check whether no descriptor is registered
    pub fn is_empty(&self) -> bool {
        self.fds.read().is_empty()
    }

    /// Resolve a path naming a descriptor index
    fn lookup(&self, path: &str) -> Result<(usize, Arc<Descriptor>)> {
        let fd = path.trim().parse::<usize>().map_err(|_| Error::NoSuchFile)?;
        let desc = self.get(fd).map_err(|_| Error::NoSuchFile)?;
        Ok((fd, desc))
    }

    /// Get the size and file type of the descriptor named by `path`
    pub fn getfileinfo(&self, path: &str) -> Result<(u64, FileType)> {
        let (_, desc) = self.lookup(path)?;
        Ok((desc.size(), desc.file_type()))
    }

    /// Open the descriptor named by `path`
    ///
    /// The flags are accepted but not enforced: every region is readable
    /// and writable.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<usize> {
        let (fd, _) = self.lookup(path)?;
        log::trace!("open {} as descriptor {} ({:?})", path, fd, flags);
        Ok(fd)
    }

    /// Close a descriptor; registrations outlive opens
    pub fn close(&self, _fd: usize) -> Result<()> {
        Ok(())
    }

    /// Read into `bufs` starting at `offset`
    ///
    /// Each buffer is clipped to the bytes left in the region and the
    /// transfer stops after the first short buffer.
    pub fn iovread(&self, fd: usize, bufs: &mut [&mut [u8]], offset: i64) -> Result<usize> {
        let desc = self.get(fd)?;
        let data = desc.data.lock();
        let mut pos = match start_of(offset, data.len())? {
            Some(pos) => pos,
            None => return Ok(0),
        };

        let mut done = 0;
        for buf in bufs.iter_mut() {
            let len = buf.len().min(data.len() - pos);
            buf[..len].copy_from_slice(&data[pos..pos + len]);
            done += len;
            pos += len;
            if len != buf.len() {
                break;
            }
        }
        Ok(done)
    }

    /// Write `bufs` starting at `offset`, clipped like [`FdTable::iovread`]
    pub fn iovwrite(&self, fd: usize, bufs: &[&[u8]], offset: i64) -> Result<usize> {
        let desc = self.get(fd)?;
        let mut data = desc.data.lock();
        let mut pos = match start_of(offset, data.len())? {
            Some(pos) => pos,
            None => return Ok(0),
        };

        let mut done = 0;
        for buf in bufs {
            let len = buf.len().min(data.len() - pos);
            data[pos..pos + len].copy_from_slice(&buf[..len]);
            done += len;
            pos += len;
            if len != buf.len() {
                break;
            }
        }
        Ok(done)
    }

    /// Synchronize a descriptor; regions live in memory so there is
    /// nothing to flush
    pub fn syncfd(&self, fd: usize, _flags: i32, _start: u64, _len: u64) -> Result<()> {
        self.get(fd).map(|_| ())
    }

    /// Perform a block transfer and report it through `done`
    ///
    /// `done` runs exactly once, before this returns, with the number of
    /// bytes moved and an errno (zero on success). Only regular-file
    /// descriptors accept block I/O.
    pub fn bio<F>(&self, fd: usize, op: BioOp, data: &mut [u8], offset: i64, done: F)
    where
        F: FnOnce(usize, i32),
    {
        match self.transfer(fd, op, data, offset) {
            Ok(len) => done(len, 0),
            Err(err) => {
                log::debug!("block i/o on descriptor {} failed: {}", fd, err);
                done(0, err.errno());
            }
        }
    }

    fn transfer(&self, fd: usize, op: BioOp, data: &mut [u8], offset: i64) -> Result<usize> {
        let desc = self.get(fd)?;
        if desc.file_type() != FileType::Reg {
            return Err(Error::BadDescriptor.into());
        }

        let mut region = desc.data.lock();
        let pos = match start_of(offset, region.len())? {
            Some(pos) if offset != IOV_NOSEEK => pos,
            Some(_) => return Err(Error::BadOffset.into()),
            None => return Ok(0),
        };

        let len = data.len().min(region.len() - pos);
        if op.contains(BioOp::READ) {
            data[..len].copy_from_slice(&region[pos..pos + len]);
        } else {
            region[pos..pos + len].copy_from_slice(&data[..len]);
        }
        Ok(len)
    }
}
