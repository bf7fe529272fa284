//! Time utilities
//!
//! This module provides the clocks exposed through the clock hypercalls
//! and the conversion of kernel sleep requests into scheduler deadlines.
//! Sleeps have millisecond granularity.

use std::time::{Duration, Instant};

use crate::utils::last_errno;
use crate::{Error, Result};

/// Clocks known to the hypercall interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Clock {
    /// Wall clock, sleeps are relative
    RelWall = 0,
    /// Monotonic clock, sleeps are absolute
    AbsMono = 1,
}

impl TryFrom<i32> for Clock {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Clock::RelWall),
            1 => Ok(Clock::AbsMono),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Seconds and nanoseconds, as exchanged with the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Whole milliseconds, negative values clamped to zero
    pub fn as_millis(self) -> u64 {
        let millis = self
            .sec
            .saturating_mul(1000)
            .saturating_add(self.nsec / 1_000_000);
        millis.max(0) as u64
    }

    /// Add `millis` milliseconds
    pub fn add_millis(self, millis: u64) -> Self {
        let nsec = self.nsec + (millis % 1000) as i64 * 1_000_000;
        Self {
            sec: self.sec + (millis / 1000) as i64 + nsec / 1_000_000_000,
            nsec: nsec % 1_000_000_000,
        }
    }
}

/// Read `clock` from the host
pub fn gettime(clock: Clock) -> Result<Timespec> {
    let id = match clock {
        Clock::RelWall => libc::CLOCK_REALTIME,
        Clock::AbsMono => libc::CLOCK_MONOTONIC,
    };

    // SAFETY: an all-zero timespec is valid and `ts` outlives the call.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(id, &mut ts) } != 0 {
        return Err(Error::Host(last_errno()));
    }

    Ok(Timespec::new(ts.tv_sec as i64, ts.tv_nsec as i64))
}

/// Convert a sleep request on `clock` into a scheduler deadline
///
/// `RelWall` requests are relative to now; `AbsMono` requests name a point
/// on the monotonic clock, and one in the past yields an expired deadline.
pub fn deadline(clock: Clock, ts: Timespec) -> Result<Instant> {
    let millis = match clock {
        Clock::RelWall => ts.as_millis(),
        Clock::AbsMono => ts.as_millis().saturating_sub(gettime(Clock::AbsMono)?.as_millis()),
    };

    Instant::now()
        .checked_add(Duration::from_millis(millis))
        .ok_or(Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, Some(Clock::RelWall))]
    #[test_case(1, Some(Clock::AbsMono))]
    #[test_case(2, None)]
    fn test_clock_from_raw(raw: i32, expected: Option<Clock>) {
        assert_eq!(Clock::try_from(raw).ok(), expected);
    }

    #[test_case(Timespec::new(1, 500_000_000), 1500; "whole")]
    #[test_case(Timespec::new(0, 999_999), 0; "sub-millisecond truncated")]
    #[test_case(Timespec::new(-3, 0), 0; "negative clamped")]
    fn test_as_millis(ts: Timespec, millis: u64) {
        assert_eq!(ts.as_millis(), millis);
    }

    #[test]
    fn test_add_millis_carries() {
        let ts = Timespec::new(1, 900_000_000).add_millis(250);
        assert_eq!(ts, Timespec::new(2, 150_000_000));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = gettime(Clock::AbsMono).unwrap();
        let b = gettime(Clock::AbsMono).unwrap();
        assert!((b.sec, b.nsec) >= (a.sec, a.nsec));
        assert!(gettime(Clock::RelWall).unwrap().sec > 0);
    }

    #[test]
    fn test_past_absolute_deadline_is_due() {
        let before = Instant::now();
        let deadline = deadline(Clock::AbsMono, Timespec::new(0, 0)).unwrap();
        assert!(deadline >= before);
        assert!(deadline <= Instant::now());
    }
}
