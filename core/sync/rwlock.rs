//! Reader-writer lock implementation
//!
//! Writers take priority: a reader cannot enter while a writer is waiting,
//! and a releasing lock wakes waiting writers (one at a time) before it
//! wakes the waiting readers (all at once).

use parking_lot::Mutex;

use crate::core::sched::{Holder, Lwp, Scheduler, WaitQueue};
use crate::core::vmm::vcpu::Cpu;
use crate::{Error, Result};

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RwMode {
    /// Shared access
    Reader = 0,
    /// Exclusive access
    Writer = 1,
}

impl TryFrom<i32> for RwMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(RwMode::Reader),
            1 => Ok(RwMode::Writer),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Lock state
///
/// `v` counts readers. `-1` marks a lock downgraded from write mode that
/// has not been re-entered or upgraded yet.
#[derive(Debug, Default)]
struct RwState {
    v: i32,
    owner: Option<Holder>,
}

/// Reader-writer lock with writer priority
#[derive(Debug, Default)]
pub struct RumpRwLock {
    state: Mutex<RwState>,
    /// Readers waiting for the lock
    readers: WaitQueue,
    /// Writers waiting for the lock
    writers: WaitQueue,
}

impl RumpRwLock {
    /// Create a new, free lock
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, mode: RwMode) -> &WaitQueue {
        match mode {
            RwMode::Reader => &self.readers,
            RwMode::Writer => &self.writers,
        }
    }

    /// Try to take the lock in `mode` without blocking
    pub fn try_enter(&self, sched: &Scheduler, mode: RwMode) -> Result<()> {
        let mut state = self.state.lock();
        match mode {
            RwMode::Reader => {
                if state.owner.is_some() || !self.writers.is_empty() {
                    return Err(Error::ResourceBusy);
                }
                state.v = if state.v == -1 { 2 } else { state.v + 1 };
            }
            RwMode::Writer => {
                if state.owner.is_some() || state.v != 0 {
                    return Err(Error::ResourceBusy);
                }
                state.owner = Some(sched.current_holder());
            }
        }
        Ok(())
    }

    /// Take the lock in `mode`, blocking if necessary
    pub fn enter(&self, cpu: &Cpu<'_>, mode: RwMode) {
        if self.try_enter(cpu.sched(), mode).is_ok() {
            return;
        }

        let nesting = cpu.release(None);
        let queue = self.queue(mode);
        while self.try_enter(cpu.sched(), mode).is_err() {
            cpu.sched().wait(queue, None);
        }
        cpu.reacquire(nesting, None);
    }

    /// Release the lock
    pub fn exit(&self, sched: &Scheduler) {
        {
            let mut state = self.state.lock();
            if state.owner.is_some() {
                state.owner = None;
            } else if state.v == -1 {
                state.v = 0;
            } else {
                assert!(state.v > 0, "exiting a rwlock that is not held");
                state.v -= 1;
            }
        }

        if !self.writers.is_empty() {
            sched.wakeup_one(&self.writers);
        } else {
            sched.wakeup_all(&self.readers);
        }
    }

    /// Convert the caller's write hold into a downgraded hold
    pub fn downgrade(&self, sched: &Scheduler) {
        let me = sched.current_holder();
        let mut state = self.state.lock();
        assert_eq!(
            state.owner,
            Some(me),
            "downgrading a rwlock not write-held by the caller"
        );
        state.owner = None;
        state.v = -1;
    }

    /// Turn a downgraded hold back into a write hold
    ///
    /// Only succeeds if nobody re-entered the lock since the downgrade.
    pub fn try_upgrade(&self, sched: &Scheduler) -> Result<()> {
        let me = sched.current_holder();
        let mut state = self.state.lock();
        if state.v != -1 {
            return Err(Error::ResourceBusy);
        }
        state.v = 0;
        state.owner = Some(me);
        Ok(())
    }

    /// Check whether the lock is held in `mode`
    ///
    /// For writers this checks the caller holds it. A downgraded lock
    /// (`v == -1`) is reported as not held for reading, which is what the
    /// kernel side expects.
    pub fn is_held(&self, sched: &Scheduler, mode: RwMode) -> bool {
        match mode {
            RwMode::Writer => {
                let me = sched.current_holder();
                self.state.lock().owner == Some(me)
            }
            RwMode::Reader => self.state.lock().v > 0,
        }
    }

    /// Get the raw reader count (`-1` when downgraded)
    pub fn value(&self) -> i32 {
        self.state.lock().v
    }

    /// Get the lwp holding the lock for writing
    pub fn owner(&self) -> Option<Lwp> {
        self.state.lock().owner.and_then(Holder::lwp)
    }

    /// Get the number of fibers waiting in `mode`
    pub fn waiting(&self, mode: RwMode) -> usize {
        self.queue(mode).len()
    }

    /// Destroy the lock
    pub fn destroy(self) {
        let state = self.state.lock();
        if state.owner.is_some() || state.v != 0 {
            log::warn!("destroying a rwlock that is still held (v = {})", state.v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vmm::test_support::{boot, yield_cpu};
    use std::sync::Arc;
    use test_case::test_case;

    #[test_case(0, Some(RwMode::Reader))]
    #[test_case(1, Some(RwMode::Writer))]
    #[test_case(2, None)]
    #[test_case(-1, None)]
    fn test_mode_from_raw(raw: i32, expected: Option<RwMode>) {
        assert_eq!(RwMode::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_writer_excludes_everyone() {
        let (sched, _token) = boot();
        let rw = RumpRwLock::new();

        rw.try_enter(&sched, RwMode::Writer).unwrap();
        assert!(rw.is_held(&sched, RwMode::Writer));
        assert!(!rw.is_held(&sched, RwMode::Reader));
        assert_eq!(rw.try_enter(&sched, RwMode::Writer), Err(Error::ResourceBusy));
        assert_eq!(rw.try_enter(&sched, RwMode::Reader), Err(Error::ResourceBusy));

        rw.exit(&sched);
        assert!(!rw.is_held(&sched, RwMode::Writer));
        rw.destroy();
    }

    #[test]
    fn test_readers_share() {
        let (sched, _token) = boot();
        let rw = RumpRwLock::new();

        rw.try_enter(&sched, RwMode::Reader).unwrap();
        rw.try_enter(&sched, RwMode::Reader).unwrap();
        assert_eq!(rw.value(), 2);
        assert!(rw.is_held(&sched, RwMode::Reader));
        assert_eq!(rw.try_enter(&sched, RwMode::Writer), Err(Error::ResourceBusy));

        rw.exit(&sched);
        rw.exit(&sched);
        assert_eq!(rw.value(), 0);
        rw.try_enter(&sched, RwMode::Writer).unwrap();
        rw.exit(&sched);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let (sched, token) = boot();
        let cpu = Cpu::new(&sched, &*token);
        let rw = Arc::new(RumpRwLock::new());
        rw.try_enter(&sched, RwMode::Reader).unwrap();

        let (s, t, l) = (Arc::clone(&sched), Arc::clone(&token), Arc::clone(&rw));
        let writer = sched
            .spawn("writer", true, move || {
                let cpu = Cpu::new(&s, &*t);
                t.schedule();
                l.enter(&cpu, RwMode::Writer);
                assert!(l.is_held(&s, RwMode::Writer));
                l.exit(&s);
                t.unschedule();
            })
            .unwrap();

        yield_cpu(&cpu);
        assert_eq!(rw.waiting(RwMode::Writer), 1);
        assert_eq!(rw.try_enter(&sched, RwMode::Reader), Err(Error::ResourceBusy));

        rw.exit(&sched);
        sched.join(writer).unwrap();
        assert_eq!(rw.value(), 0);
        assert!(!rw.is_held(&sched, RwMode::Writer));
    }

    #[test]
    fn test_release_wakes_all_readers_together() {
        let (sched, token) = boot();
        let cpu = Cpu::new(&sched, &*token);
        let rw = Arc::new(RumpRwLock::new());
        rw.try_enter(&sched, RwMode::Writer).unwrap();

        let mut readers = Vec::new();
        for name in ["r1", "r2"] {
            let (s, t, l) = (Arc::clone(&sched), Arc::clone(&token), Arc::clone(&rw));
            readers.push(
                sched
                    .spawn(name, true, move || {
                        l.enter(&Cpu::new(&s, &*t), RwMode::Reader);
                        s.yield_now();
                        l.exit(&s);
                    })
                    .unwrap(),
            );
        }

        yield_cpu(&cpu);
        assert_eq!(rw.waiting(RwMode::Reader), 2);

        rw.exit(&sched);
        assert_eq!(rw.waiting(RwMode::Reader), 0);
        sched.yield_now();
        assert_eq!(rw.value(), 2);

        for reader in readers {
            sched.join(reader).unwrap();
        }
        assert_eq!(rw.value(), 0);
    }

    #[test]
    fn test_release_prefers_waiting_writer() {
        let (sched, token) = boot();
        let cpu = Cpu::new(&sched, &*token);
        let rw = Arc::new(RumpRwLock::new());
        rw.try_enter(&sched, RwMode::Writer).unwrap();

        let (s, t, l) = (Arc::clone(&sched), Arc::clone(&token), Arc::clone(&rw));
        let reader = sched
            .spawn("reader", true, move || {
                l.enter(&Cpu::new(&s, &*t), RwMode::Reader);
                l.exit(&s);
            })
            .unwrap();
        let (s, t, l) = (Arc::clone(&sched), Arc::clone(&token), Arc::clone(&rw));
        let writer = sched
            .spawn("writer", true, move || {
                l.enter(&Cpu::new(&s, &*t), RwMode::Writer);
                s.yield_now();
                l.exit(&s);
            })
            .unwrap();

        yield_cpu(&cpu);
        assert_eq!(rw.waiting(RwMode::Reader), 1);
        assert_eq!(rw.waiting(RwMode::Writer), 1);

        rw.exit(&sched);
        assert_eq!(rw.waiting(RwMode::Writer), 0);
        assert_eq!(rw.waiting(RwMode::Reader), 1);

        sched.yield_now();
        assert_eq!(rw.value(), 0);
        assert_eq!(rw.waiting(RwMode::Reader), 1);

        sched.join(writer).unwrap();
        sched.join(reader).unwrap();
        assert_eq!(rw.value(), 0);
    }

    #[test]
    fn test_downgrade_then_upgrade() {
        let (sched, _token) = boot();
        let rw = RumpRwLock::new();

        rw.try_enter(&sched, RwMode::Writer).unwrap();
        rw.downgrade(&sched);
        assert_eq!(rw.value(), -1);
        assert_eq!(rw.owner(), None);
        assert!(!rw.is_held(&sched, RwMode::Writer));
        assert!(!rw.is_held(&sched, RwMode::Reader));

        rw.try_upgrade(&sched).unwrap();
        assert_eq!(rw.value(), 0);
        assert!(rw.is_held(&sched, RwMode::Writer));
        rw.exit(&sched);
        assert!(!rw.is_held(&sched, RwMode::Writer));
    }

    #[test]
    fn test_upgrade_fails_after_reader_joins() {
        let (sched, _token) = boot();
        let rw = RumpRwLock::new();

        assert_eq!(rw.try_upgrade(&sched), Err(Error::ResourceBusy));

        rw.try_enter(&sched, RwMode::Writer).unwrap();
        rw.downgrade(&sched);
        rw.try_enter(&sched, RwMode::Reader).unwrap();
        assert_eq!(rw.value(), 2);
        assert!(rw.is_held(&sched, RwMode::Reader));
        assert_eq!(rw.try_upgrade(&sched), Err(Error::ResourceBusy));

        rw.exit(&sched);
        rw.exit(&sched);
        assert_eq!(rw.value(), 0);
    }

    #[test]
    fn test_exit_downgraded_lock() {
        let (sched, _token) = boot();
        let rw = RumpRwLock::new();
        rw.try_enter(&sched, RwMode::Writer).unwrap();
        rw.downgrade(&sched);
        rw.exit(&sched);
        assert_eq!(rw.value(), 0);
        rw.try_enter(&sched, RwMode::Writer).unwrap();
        rw.exit(&sched);
    }

    #[test]
    #[should_panic(expected = "not write-held by the caller")]
    fn test_downgrade_without_write_hold_is_fatal() {
        let (sched, _token) = boot();
        let rw = RumpRwLock::new();
        rw.try_enter(&sched, RwMode::Reader).unwrap();
        rw.downgrade(&sched);
    }
}
