//! Hypervisor context
//!
//! The [`Hypervisor`] bundles everything the hypercall layer needs: the
//! configuration, the fiber scheduler, the virtual CPU and the descriptor
//! table. It is constructed explicitly and passed to whoever needs it;
//! the C ABI keeps a single instance for the lifetime of the process.

use std::sync::Arc;

use crate::config::HypervisorConfig;
use crate::core::sched::{FiberHandle, Lwp, LwpOp, Scheduler};
use crate::drivers::block::FdTable;
use crate::utils::time::{self, Clock, Timespec};
use crate::{Error, Result};

pub mod vcpu;

pub use self::vcpu::{Cpu, Nesting, VcpuToken, VirtualCpu};

/// Name of the parameter reporting the number of virtual CPUs
pub const PARAM_NCPU: &str = "_RUMPUSER_NCPU";
/// Name of the parameter reporting the host name
pub const PARAM_HOSTNAME: &str = "_RUMPUSER_HOSTNAME";

/// Hypervisor context
pub struct Hypervisor {
    config: HypervisorConfig,
    sched: Arc<Scheduler>,
    vcpu: Arc<dyn VirtualCpu>,
    fds: FdTable,
}

impl Hypervisor {
    /// Create a context around an existing scheduler and virtual CPU
    pub fn new(
        config: HypervisorConfig,
        sched: Arc<Scheduler>,
        vcpu: Arc<dyn VirtualCpu>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!(
            "hypervisor context created (ncpu {}, host {})",
            config.ncpu,
            config.hostname
        );

        Ok(Self {
            config,
            sched,
            vcpu,
            fds: FdTable::new(),
        })
    }

    /// Create a context running on the in-crate virtual CPU token
    pub fn with_token(config: HypervisorConfig) -> Result<Self> {
        let sched = Scheduler::new();
        let token = Arc::new(VcpuToken::new(Arc::clone(&sched)));
        Self::new(config, sched, token)
    }

    /// Turn the calling host thread into the main fiber
    pub fn start(&self) -> FiberHandle {
        let main = self.sched.adopt("main");
        log::info!("scheduler started, main fiber {}", main.id());
        main
    }

    /// Get the blocking capability
    pub fn cpu(&self) -> Cpu<'_> {
        Cpu::new(&self.sched, &*self.vcpu)
    }

    /// Get the scheduler
    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Get the configuration
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Get the descriptor table
    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    /// Read `clock`
    pub fn clock_gettime(&self, clock: Clock) -> Result<Timespec> {
        time::gettime(clock)
    }

    /// Sleep for a relative time or until an absolute monotonic time
    ///
    /// The virtual CPU is given up for the duration of the sleep.
    pub fn clock_sleep(&self, clock: Clock, ts: Timespec) -> Result<()> {
        let deadline = time::deadline(clock, ts)?;

        let cpu = self.cpu();
        let nesting = cpu.release(None);
        self.sched.sleep_until(deadline);
        cpu.reacquire(nesting, None);
        Ok(())
    }

    /// Look up a parameter and copy it into `buf`
    ///
    /// The value is copied like `strncpy`: NUL-padded to the end of the
    /// buffer, unterminated if it fills the buffer exactly.
    pub fn getparam(&self, name: &str, buf: &mut [u8]) -> Result<()> {
        let value = match name {
            PARAM_NCPU => self.config.ncpu.to_string(),
            PARAM_HOSTNAME => self.config.hostname.clone(),
            _ if name.starts_with('_') => return Err(Error::InvalidArgument),
            _ => {
                if !self.config.env_params {
                    return Err(Error::InvalidArgument);
                }
                let value = std::env::var(name).map_err(|_| Error::InvalidArgument)?;
                if value.len() + 1 > buf.len() {
                    return Err(Error::InvalidArgument);
                }
                value
            }
        };

        strncpy(buf, value.as_bytes());
        Ok(())
    }

    /// Create a fiber running `entry`
    pub fn thread_create<F>(&self, name: &str, joinable: bool, entry: F) -> Result<FiberHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.spawn(name, joinable, entry)
    }

    /// Wait for a joinable fiber to terminate
    pub fn thread_join(&self, handle: FiberHandle) -> Result<()> {
        let cpu = self.cpu();
        let nesting = cpu.release(None);
        let result = self.sched.join(handle);
        cpu.reacquire(nesting, None);
        result
    }

    /// Terminate the calling fiber
    ///
    /// The kernel has already unscheduled the caller; the virtual CPU is
    /// not touched.
    pub fn thread_exit(&self) -> ! {
        self.sched.exit_current()
    }

    /// Apply an lwp operation to the calling fiber
    pub fn curlwpop(&self, op: LwpOp, lwp: Option<Lwp>) {
        match op {
            LwpOp::Create | LwpOp::Destroy => {}
            LwpOp::Set => self.sched.attach_lwp(lwp),
            LwpOp::Clear => self.sched.detach_lwp(lwp),
        }
    }

    /// Get the lwp attached to the calling fiber
    pub fn curlwp(&self) -> Option<Lwp> {
        self.sched.current_lwp()
    }
}

/// Copy `src` into `dst` with `strncpy` semantics
fn strncpy(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}


#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use test_case::test_case;

    fn boot() -> Hypervisor {
        let hv = Hypervisor::with_token(HypervisorConfig::default()).unwrap();
        hv.start();
        hv
    }

    #[test_case(PARAM_NCPU, b"1\0\0\0"; "ncpu")]
    #[test_case(PARAM_HOSTNAME, b"rump"; "hostname fills buffer")]
    fn test_builtin_params(name: &str, expected: &[u8; 4]) {
        let hv = boot();
        let mut buf = [0xffu8; 4];
        hv.getparam(name, &mut buf).unwrap();
        assert_eq!(&buf, expected);
    }

    #[test]
    fn test_unknown_reserved_param() {
        let hv = boot();
        let mut buf = [0u8; 16];
        assert_eq!(hv.getparam("_RUMPUSER_NOPE", &mut buf), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_env_param() {
        let hv = boot();
        std::env::set_var("RUMPFIBER_TEST_PARAM", "value");

        let mut buf = [0xffu8; 8];
        hv.getparam("RUMPFIBER_TEST_PARAM", &mut buf).unwrap();
        assert_eq!(&buf, b"value\0\0\0");

        let mut small = [0u8; 5];
        assert_eq!(
            hv.getparam("RUMPFIBER_TEST_PARAM", &mut small),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            hv.getparam("RUMPFIBER_TEST_UNSET_PARAM", &mut buf),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_env_params_disabled() {
        let config = HypervisorConfig {
            env_params: false,
            ..HypervisorConfig::default()
        };
        let hv = Hypervisor::with_token(config).unwrap();
        hv.start();
        std::env::set_var("RUMPFIBER_TEST_HIDDEN", "x");

        let mut buf = [0u8; 8];
        assert_eq!(hv.getparam("RUMPFIBER_TEST_HIDDEN", &mut buf), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HypervisorConfig {
            ncpu: 2,
            ..HypervisorConfig::default()
        };
        assert!(matches!(
            Hypervisor::with_token(config),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn test_clock_sleep_relative() {
        let hv = boot();
        let start = Instant::now();
        hv.clock_sleep(Clock::RelWall, Timespec::new(0, 20_000_000)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_clock_sleep_absolute() {
        let hv = boot();
        let now = hv.clock_gettime(Clock::AbsMono).unwrap();
        let target = now.add_millis(15);

        hv.clock_sleep(Clock::AbsMono, target).unwrap();
        let after = hv.clock_gettime(Clock::AbsMono).unwrap();
        assert!(after.as_millis() >= target.as_millis());
    }

    #[test]
    fn test_sleep_lets_other_fibers_run() {
        let hv = Arc::new(boot());
        let ran = Arc::new(Mutex::new(false));

        let (h, r) = (Arc::clone(&hv), Arc::clone(&ran));
        let child = hv
            .thread_create("sleeper-peer", true, move || {
                h.curlwpop(LwpOp::Set, Lwp::new(0x2000));
                assert_eq!(h.curlwp(), Lwp::new(0x2000));
                *r.lock() = true;
            })
            .unwrap();

        hv.clock_sleep(Clock::RelWall, Timespec::new(0, 5_000_000)).unwrap();
        assert!(*ran.lock());
        hv.thread_join(child).unwrap();
        assert_eq!(hv.curlwp(), None);
    }

    #[test]
    fn test_curlwpop() {
        let hv = boot();
        let lwp = Lwp::new(0x4000);

        hv.curlwpop(LwpOp::Create, lwp);
        assert_eq!(hv.curlwp(), None);
        hv.curlwpop(LwpOp::Set, lwp);
        assert_eq!(hv.curlwp(), lwp);
        hv.curlwpop(LwpOp::Destroy, lwp);
        assert_eq!(hv.curlwp(), lwp);
        hv.curlwpop(LwpOp::Clear, lwp);
        assert_eq!(hv.curlwp(), None);
    }

    #[test]
    fn test_thread_exit() {
        let hv = Arc::new(boot());
        let h = Arc::clone(&hv);
        let child = hv
            .thread_create("exiter", true, move || h.thread_exit())
            .unwrap();
        hv.thread_join(child).unwrap();
    }

    #[test]
    fn test_thread_exit_leaves_cpu_alone() {
        let sched = Scheduler::new();
        let vcpu = Arc::new(test_support::RecordingCpu::new(1));
        let hv = Arc::new(Hypervisor::new(HypervisorConfig::default(), sched, vcpu.clone()).unwrap());
        hv.start();

        let h = Arc::clone(&hv);
        let child = hv
            .thread_create("exiter", true, move || h.thread_exit())
            .unwrap();
        hv.thread_join(child).unwrap();

        // Only the join's own handshake
        assert_eq!(vcpu.events(), vec![("release", false), ("reacquire", false)]);
        assert_eq!(hv.config().ncpu, 1);
    }

    #[test]
    fn test_strncpy() {
        let mut buf = [0xffu8; 3];
        strncpy(&mut buf, b"abcdef");
        assert_eq!(&buf, b"abc");
        strncpy(&mut buf, b"x");
        assert_eq!(&buf, b"x\0\0");
    }
}
