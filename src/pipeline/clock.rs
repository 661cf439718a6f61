//! Host clock in 100 ns ticks

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::frame::UNITS;

/// Monotonic clock the stream paces against
pub trait HostClock: Send + Sync {
    /// Current time in 100 ns ticks
    fn now(&self) -> i64;

    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`], zero at construction
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> i64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() as i64 * UNITS + i64::from(elapsed.subsec_nanos()) / 100
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to. Sleeping advances it by the slept
/// amount, so a paced stream driven by it never blocks.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
    slept: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ticks: i64) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: i64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Total ticks spent in `sleep`
    pub fn slept(&self) -> i64 {
        self.slept.load(Ordering::SeqCst)
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let ticks = (duration.as_nanos() / 100) as i64;
        self.slept.fetch_add(ticks, Ordering::SeqCst);
        self.advance(ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        clock.set(1_000);
        clock.sleep(Duration::from_millis(1));
        assert_eq!(clock.now(), 11_000);
        assert_eq!(clock.slept(), 10_000);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now() - a >= 20_000);
    }
}
