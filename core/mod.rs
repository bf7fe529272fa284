//! Core hypervisor modules
//!
//! This module contains the core functionality of the hypervisor:
//! the fiber scheduler, the virtual CPU handshake, the kernel locking
//! primitives and process control.

pub mod vmm;
pub mod sched;
pub mod sync;
pub mod process;
