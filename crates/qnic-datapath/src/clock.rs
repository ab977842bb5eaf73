//! Timestamp source for completion records

use qnic_common::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of completion timestamps
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Hand-driven clock for deterministic runs
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at `start` nanoseconds
    pub fn new(start: u64) -> Self {
        Self { nanos: AtomicU64::new(start) }
    }

    /// Jump to `nanos`
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    /// Move forward by `nanos`
    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now().as_nanos(), 100);
        clock.advance(50);
        assert_eq!(clock.now().as_nanos(), 150);
        clock.set(7);
        assert_eq!(clock.now(), Timestamp::from_nanos(7));
    }

    #[test]
    fn test_system_clock_moves() {
        assert!(SystemClock.now().as_nanos() > 0);
    }
}
