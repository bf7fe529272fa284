//! Synchronization primitives
//!
//! This module provides the locking primitives the rump kernel builds its
//! own locks on. Every blocking path follows the same handshake: release
//! the virtual CPU, wait on a FIFO queue, retry, reacquire the virtual CPU.

pub mod mutex;
pub mod rwlock;
pub mod condvar;

pub use self::condvar::RumpCondvar;
pub use self::mutex::{MutexFlags, RumpMutex};
pub use self::rwlock::{RumpRwLock, RwMode};
