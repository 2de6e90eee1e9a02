//! Capture timestamp source.
//!
//! Every frame gets stamped on the socket-reader hot path, so the clock must
//! not cost a syscall per read. `TscClock` anchors the CPU time-stamp counter
//! to wall clock once at startup and advances by TSC deltas from there;
//! `SystemClock` is the plain fallback used at archival boundaries where a
//! ~25ns `clock_gettime` does not matter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// A source of nanosecond timestamps since the UNIX epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_ns(&self) -> u64;
}

/// Wall clock via `std::time::SystemTime`.
///
/// Susceptible to NTP steps and slower than the TSC path, but needs no
/// calibration. Used by the archiver, which times segments, not frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        u64::try_from(timestamp.as_nanos()).expect("system time exceeds timestamp range")
    }
}

/// TSC-backed clock via `quanta`, anchored to wall clock at construction.
///
/// Reads are ~6-10ns and monotonically non-decreasing. The anchor drifts from
/// wall clock over very long uptimes; the connector restarts daily in
/// practice, which re-anchors it.
#[derive(Debug, Clone)]
pub struct TscClock {
    clock: quanta::Clock,
    base_wall_ns: u64,
    base_instant: quanta::Instant,
}

impl TscClock {
    /// Calibrates the TSC against wall clock.
    ///
    /// Fails when the wall-clock reference is unusable (pre-epoch time, i.e.
    /// a badly misconfigured host). The connector treats that as fatal: a
    /// process that cannot time frames must not capture them.
    pub fn calibrate() -> Result<Self> {
        let clock = quanta::Clock::new();
        let base_instant = clock.now();
        let base_wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Calibration("system time before UNIX epoch"))?;
        let base_wall_ns =
            u64::try_from(base_wall.as_nanos()).map_err(|_| Error::Calibration("wall clock out of range"))?;

        // Sanity probe: two consecutive reads must not go backwards.
        let a = clock.now();
        let b = clock.now();
        if b < a {
            return Err(Error::Calibration("tsc reads not monotonic"));
        }

        Ok(Self {
            clock,
            base_wall_ns,
            base_instant,
        })
    }

    /// Offset of `now_ns` from a fresh wall-clock read, for startup logging.
    pub fn drift(&self) -> Duration {
        let wall = SystemClock.now_ns();
        let tsc = self.now_ns();
        Duration::from_nanos(wall.abs_diff(tsc))
    }
}

impl Clock for TscClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.base_instant);
        self.base_wall_ns + delta.as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_clock_monotonic() {
        let clock = TscClock::calibrate().unwrap();
        let mut prev = clock.now_ns();
        for _ in 0..10_000 {
            let now = clock.now_ns();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn tsc_clock_tracks_wall_clock() {
        let clock = TscClock::calibrate().unwrap();
        // Freshly calibrated, the two sources should agree within a second.
        assert!(clock.drift() < Duration::from_secs(1));
    }

    #[test]
    fn system_clock_advances() {
        let a = SystemClock.now_ns();
        std::thread::sleep(Duration::from_millis(2));
        let b = SystemClock.now_ns();
        assert!(b > a);
    }
}
