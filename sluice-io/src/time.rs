//! Duty cycle timing
//!
//! Idle strategies for the sender, receiver and conductor loops, and a
//! periodic timer for work that runs on an interval.

use std::thread;
use std::time::{Duration, Instant};

/// Backs off from spinning to yielding to parking as idle cycles accumulate.
///
/// Any cycle that did work resets the strategy to spinning.
#[derive(Debug, Clone)]
pub struct BackoffIdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdleStrategy {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        BackoffIdleStrategy {
            max_spins,
            max_yields,
            min_park,
            max_park: max_park.max(min_park),
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }

    /// Idle after a duty cycle that did `work_count` units of work.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            thread::yield_now();
        } else {
            thread::park_timeout(self.park);
            self.park = (self.park * 2).min(self.max_park);
        }
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }

    /// Current park duration once spinning and yielding are exhausted.
    pub fn park_duration(&self) -> Duration {
        self.park
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(10, 20, Duration::from_micros(1), Duration::from_millis(1))
    }
}

/// Timer for periodic operations
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Instant::now(),
        }
    }

    pub fn expired(&self) -> bool {
        self.last_fire.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.last_fire = Instant::now();
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self) -> bool {
        if self.expired() {
            self.reset();
            true
        } else {
            false
        }
    }
}
