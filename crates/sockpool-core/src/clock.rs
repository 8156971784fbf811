//! Diagnostics clock.
//!
//! All timestamps in sockpool are milliseconds on a monotonic clock that
//! starts at zero when the clock is created. Components receive the clock
//! as an `Arc<dyn Clock>` rather than reaching for a global, so tests can
//! swap in a [`ManualClock`] and step time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond timestamp source.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the clock's epoch.
    fn now_millis(&self) -> u64;
}

/// Default clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    /// Jump to an absolute timestamp.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now_millis();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_steps() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_usable_as_trait_object() {
        let clock: std::sync::Arc<dyn Clock> = std::sync::Arc::new(ManualClock::new(7));
        assert_eq!(clock.now_millis(), 7);
    }
}
