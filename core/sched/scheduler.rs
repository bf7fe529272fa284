//! Main scheduler implementation
//!
//! This module provides the fiber engine: fiber creation, the run queue,
//! blocking on wait queues with optional timeouts, wakeups, joins and
//! exits. The CPU is handed from fiber to fiber explicitly; a fiber that
//! is not `current` never runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{
    alloc_fiber_id, bind_current, current_fiber, FiberHandle, FiberId, FiberState, Holder, Lwp,
    WaitQueue, WakeReason,
};
use crate::{Error, Result};

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Total number of fibers created (adopted or spawned)
    pub fibers_created: u64,
    /// Number of fibers not yet reaped
    pub live_fibers: usize,
    /// Total CPU hand-offs between distinct fibers
    pub context_switches: u64,
    /// Waits that ended because their deadline expired
    pub timeouts: u64,
}

/// Fiber control block
#[derive(Debug)]
struct FiberControlBlock {
    /// Fiber name
    name: String,
    /// Fiber state
    state: FiberState,
    /// Whether the fiber is reaped by a join
    joinable: bool,
    /// Attached kernel lwp
    lwp: Option<Lwp>,
    /// Reason for the last wakeup, consumed by the waiter
    wake: Option<WakeReason>,
    /// Deadline of the current wait
    deadline: Option<Instant>,
    /// Fibers blocked in a join on this fiber
    joiners: VecDeque<FiberId>,
    /// Whether the fiber's entry panicked
    panicked: bool,
}

impl FiberControlBlock {
    fn new(name: &str, joinable: bool) -> Self {
        Self {
            name: name.to_string(),
            state: FiberState::Ready,
            joinable,
            lwp: None,
            wake: None,
            deadline: None,
            joiners: VecDeque::new(),
            panicked: false,
        }
    }
}

/// Scheduler state guarded by the scheduler lock
struct SchedInner {
    /// Fiber holding the CPU
    current: Option<FiberId>,
    /// Ready fibers in hand-off order
    run_queue: VecDeque<FiberId>,
    /// Fiber control blocks
    fibers: HashMap<FiberId, FiberControlBlock>,
    /// Statistics
    stats: SchedulerStats,
}

impl SchedInner {
    /// Move a blocked fiber to the back of the run queue
    fn make_ready(&mut self, id: FiberId, reason: WakeReason) -> bool {
        match self.fibers.get_mut(&id) {
            Some(fcb) if fcb.state == FiberState::Blocked => {
                fcb.state = FiberState::Ready;
                fcb.wake = Some(reason);
                fcb.deadline = None;
                self.run_queue.push_back(id);
                true
            }
            _ => false,
        }
    }

    fn fiber_mut(&mut self, id: FiberId) -> &mut FiberControlBlock {
        match self.fibers.get_mut(&id) {
            Some(fcb) => fcb,
            None => panic!("fiber {} is not known to this scheduler", id),
        }
    }
}

/// Cooperative fiber scheduler
pub struct Scheduler {
    /// Scheduler state
    inner: Mutex<SchedInner>,
    /// Signalled whenever `current` changes
    switch: Condvar,
}

/// Runs the exit path of a spawned fiber, including on unwind
struct FiberExit<'a> {
    sched: &'a Scheduler,
    id: FiberId,
}

impl Drop for FiberExit<'_> {
    fn drop(&mut self) {
        self.sched.finish(self.id, thread::panicking());
    }
}

impl Scheduler {
    /// Create a new scheduler with no fibers
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SchedInner {
                current: None,
                run_queue: VecDeque::new(),
                fibers: HashMap::new(),
                stats: SchedulerStats::default(),
            }),
            switch: Condvar::new(),
        })
    }

    /// Register the calling host thread as a fiber
    ///
    /// Returns once the new fiber holds the CPU.
    pub fn adopt(&self, name: &str) -> FiberHandle {
        let id = alloc_fiber_id();
        bind_current(Some(id));

        let mut inner = self.inner.lock();
        inner.fibers.insert(id, FiberControlBlock::new(name, false));
        inner.run_queue.push_back(id);
        inner.stats.fibers_created += 1;
        inner.stats.live_fibers += 1;
        if inner.current.is_none() {
            self.dispatch(&mut inner);
        }
        self.wait_for_cpu(&mut inner, id, None);

        log::debug!("adopted host thread as fiber {} ({})", id, name);
        FiberHandle::new(id)
    }

    /// Create a new fiber
    ///
    /// The fiber is appended to the run queue and first runs when the
    /// current fiber blocks, yields or exits.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, joinable: bool, entry: F) -> Result<FiberHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = alloc_fiber_id();
        let mut inner = self.inner.lock();
        inner.fibers.insert(id, FiberControlBlock::new(name, joinable));
        inner.run_queue.push_back(id);

        let sched = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || sched.trampoline(id, entry));
        if let Err(err) = spawned {
            log::error!("failed to create host thread for fiber {}: {}", name, err);
            inner.fibers.remove(&id);
            inner.run_queue.retain(|&fiber| fiber != id);
            return Err(Error::ResourceUnavailable);
        }

        inner.stats.fibers_created += 1;
        inner.stats.live_fibers += 1;
        if inner.current.is_none() {
            self.dispatch(&mut inner);
        }

        log::trace!("spawned fiber {} ({}, joinable: {})", id, name, joinable);
        Ok(FiberHandle::new(id))
    }

    /// Entry point of the host thread backing a spawned fiber
    fn trampoline<F: FnOnce()>(self: Arc<Self>, id: FiberId, entry: F) {
        bind_current(Some(id));
        {
            let mut inner = self.inner.lock();
            self.wait_for_cpu(&mut inner, id, None);
        }

        let _exit = FiberExit { sched: &self, id };
        entry();
    }

    /// Terminate a fiber and hand the CPU on
    fn finish(&self, id: FiberId, panicked: bool) {
        let mut inner = self.inner.lock();
        let (joinable, joiners) = match inner.fibers.get_mut(&id) {
            Some(fcb) => {
                fcb.state = FiberState::Terminated;
                fcb.panicked = panicked;
                (fcb.joinable, std::mem::take(&mut fcb.joiners))
            }
            None => (false, VecDeque::new()),
        };

        for joiner in joiners {
            inner.make_ready(joiner, WakeReason::Woken);
        }
        if !joinable && inner.fibers.remove(&id).is_some() {
            inner.stats.live_fibers = inner.stats.live_fibers.saturating_sub(1);
        }

        bind_current(None);
        if inner.current == Some(id) {
            self.dispatch(&mut inner);
        }

        if panicked {
            log::error!("fiber {} terminated by panic", id);
        } else {
            log::trace!("fiber {} exited", id);
        }
    }

    /// Give the CPU to the fiber at the head of the run queue
    fn dispatch(&self, inner: &mut SchedInner) {
        let previous = inner.current;
        inner.current = inner.run_queue.pop_front();

        if let Some(next) = inner.current {
            inner.fiber_mut(next).state = FiberState::Running;
            if previous != Some(next) {
                inner.stats.context_switches += 1;
            }
        }

        self.switch.notify_all();
    }

    /// Park the calling host thread until `me` holds the CPU
    ///
    /// A blocked fiber whose deadline passes moves itself to the run queue
    /// here; it still only runs once the CPU is handed to it.
    fn wait_for_cpu(
        &self,
        inner: &mut MutexGuard<'_, SchedInner>,
        me: FiberId,
        queue: Option<&WaitQueue>,
    ) {
        loop {
            if inner.current == Some(me) {
                return;
            }

            let deadline = inner
                .fibers
                .get(&me)
                .filter(|fcb| fcb.state == FiberState::Blocked)
                .and_then(|fcb| fcb.deadline);

            match deadline {
                Some(deadline) if Instant::now() >= deadline => self.expire(inner, me, queue),
                Some(deadline) => {
                    self.switch.wait_until(inner, deadline);
                }
                None => self.switch.wait(inner),
            }
        }
    }

    /// Time out the wait of `me`
    fn expire(&self, inner: &mut SchedInner, me: FiberId, queue: Option<&WaitQueue>) {
        if let Some(queue) = queue {
            queue.remove(me);
        }
        if inner.make_ready(me, WakeReason::TimedOut) {
            inner.stats.timeouts += 1;
        }
        if inner.current.is_none() {
            self.dispatch(inner);
        }
    }

    /// Get the calling fiber, which must hold the CPU
    fn running(&self, inner: &SchedInner) -> FiberId {
        let me = match current_fiber() {
            Some(id) => id,
            None => panic!("scheduler called from a host thread that is not a fiber"),
        };
        assert_eq!(
            inner.current,
            Some(me),
            "fiber {} called the scheduler without holding the CPU",
            me
        );
        me
    }

    /// Block the running fiber and switch away
    fn block_current(
        &self,
        inner: &mut MutexGuard<'_, SchedInner>,
        me: FiberId,
        queue: Option<&WaitQueue>,
        deadline: Option<Instant>,
    ) -> WakeReason {
        if let Some(queue) = queue {
            queue.push(me);
        }

        let fcb = inner.fiber_mut(me);
        fcb.state = FiberState::Blocked;
        fcb.wake = None;
        fcb.deadline = deadline;

        self.dispatch(inner);
        self.wait_for_cpu(inner, me, queue);

        inner.fiber_mut(me).wake.take().unwrap_or(WakeReason::Woken)
    }

    /// Block the running fiber on a wait queue
    ///
    /// With a timeout, the fiber resumes with [`WakeReason::TimedOut`] if no
    /// wakeup reached it before the deadline.
    pub fn wait(&self, queue: &WaitQueue, timeout: Option<Duration>) -> WakeReason {
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.block_current(&mut inner, me, Some(queue), deadline)
    }

    /// Wake the longest-waiting fiber on a queue
    pub fn wakeup_one(&self, queue: &WaitQueue) -> bool {
        let mut inner = self.inner.lock();
        while let Some(id) = queue.pop() {
            if inner.make_ready(id, WakeReason::Woken) {
                return true;
            }
        }
        false
    }

    /// Wake every fiber on a queue, oldest first
    pub fn wakeup_all(&self, queue: &WaitQueue) -> usize {
        let mut inner = self.inner.lock();
        queue
            .drain()
            .into_iter()
            .filter(|&id| inner.make_ready(id, WakeReason::Woken))
            .count()
    }

    /// Move the running fiber to the back of the run queue
    pub fn yield_now(&self) {
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        inner.fiber_mut(me).state = FiberState::Ready;
        inner.run_queue.push_back(me);
        self.dispatch(&mut inner);
        self.wait_for_cpu(&mut inner, me, None);
    }

    /// Block the running fiber until `deadline`
    pub fn sleep_until(&self, deadline: Instant) {
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        self.block_current(&mut inner, me, None, Some(deadline));
    }

    /// Block until a joinable fiber terminates, then reap it
    pub fn join(&self, handle: FiberHandle) -> Result<()> {
        let target = handle.id();
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        if target == me {
            return Err(Error::InvalidArgument);
        }

        loop {
            let fcb = match inner.fibers.get_mut(&target) {
                Some(fcb) => fcb,
                None => return Err(Error::NotFound),
            };
            if !fcb.joinable {
                return Err(Error::InvalidArgument);
            }
            if fcb.state == FiberState::Terminated {
                let panicked = fcb.panicked;
                inner.fibers.remove(&target);
                inner.stats.live_fibers = inner.stats.live_fibers.saturating_sub(1);
                return if panicked { Err(Error::InvalidState) } else { Ok(()) };
            }

            fcb.joiners.push_back(me);
            self.block_current(&mut inner, me, None, None);
        }
    }

    /// Terminate the running fiber immediately
    ///
    /// Nothing on the fiber's stack is unwound: the backing host thread is
    /// parked for good once the CPU has been handed on.
    pub fn exit_current(&self) -> ! {
        let me = {
            let inner = self.inner.lock();
            self.running(&inner)
        };
        self.finish(me, false);
        loop {
            thread::park();
        }
    }

    /// Attach an lwp to the running fiber, replacing any previous one
    pub fn attach_lwp(&self, lwp: Option<Lwp>) {
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        inner.fiber_mut(me).lwp = lwp;
    }

    /// Detach the running fiber's lwp
    ///
    /// Detaching an lwp other than the attached one is a contract violation.
    pub fn detach_lwp(&self, lwp: Option<Lwp>) {
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        let fcb = inner.fiber_mut(me);
        assert_eq!(
            fcb.lwp, lwp,
            "fiber {} ({}) detaching an lwp it does not carry",
            me, fcb.name
        );
        fcb.lwp = None;
    }

    /// Get the lwp attached to the running fiber
    pub fn current_lwp(&self) -> Option<Lwp> {
        let inner = self.inner.lock();
        current_fiber()
            .and_then(|me| inner.fibers.get(&me))
            .and_then(|fcb| fcb.lwp)
    }

    /// Get the identity the running fiber holds locks under
    pub fn current_holder(&self) -> Holder {
        let mut inner = self.inner.lock();
        let me = self.running(&inner);
        match inner.fiber_mut(me).lwp {
            Some(lwp) => Holder::Lwp(lwp),
            None => Holder::Fiber(me),
        }
    }

    /// Get the fiber holding the CPU
    pub fn current(&self) -> Option<FiberId> {
        self.inner.lock().current
    }

    /// Get the state of a fiber that has not been reaped
    pub fn state_of(&self, handle: FiberHandle) -> Option<FiberState> {
        self.inner.lock().fibers.get(&handle.id()).map(|fcb| fcb.state)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats
    }
}
