//! Clocks
//!
//! Time-dependent operations take a nanosecond sample from the caller, read
//! from a [`NanoClock`]. Status messages are stamped with wall-clock
//! milliseconds from an [`EpochClock`] so monitoring tools can compare them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic clock in nanoseconds
pub trait NanoClock: Send + Sync {
    fn nano_time(&self) -> i64;
}

/// Wall clock in milliseconds since the Unix epoch
pub trait EpochClock: Send + Sync {
    fn time_millis(&self) -> i64;
}

/// Monotonic clock counting from its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemNanoClock {
    start: Instant,
}

impl SystemNanoClock {
    pub fn new() -> Self {
        SystemNanoClock {
            start: Instant::now(),
        }
    }
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemNanoClock {
    #[inline]
    fn nano_time(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Wall clock backed by [`SystemTime`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
///
/// Serves as both a nano and an epoch clock for tests driving synthetic time.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start_nanos: i64) -> Self {
        ManualClock {
            nanos: AtomicI64::new(start_nanos),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    /// Advance by `nanos`, returning the new time.
    pub fn advance(&self, nanos: i64) -> i64 {
        self.nanos.fetch_add(nanos, Ordering::AcqRel) + nanos
    }
}

impl NanoClock for ManualClock {
    fn nano_time(&self) -> i64 {
        self.nanos.load(Ordering::Acquire)
    }
}

impl EpochClock for ManualClock {
    fn time_millis(&self) -> i64 {
        self.nano_time() / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_nano_clock_monotonic() {
        let clock = SystemNanoClock::new();
        let t1 = clock.nano_time();
        let t2 = clock.nano_time();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_system_epoch_clock() {
        // Any time after 2020-01-01
        assert!(SystemEpochClock.time_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5_000_000);
        assert_eq!(clock.nano_time(), 5_000_000);
        assert_eq!(clock.time_millis(), 5);

        assert_eq!(clock.advance(1_000_000), 6_000_000);
        clock.set(42);
        assert_eq!(clock.nano_time(), 42);
    }
}
