use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::utils::date_time;

/// Monotonic time source, in microseconds.
///
/// All queue-age and refresh-frequency decisions in the scheduler read an
/// injected `Clock` so that tests can drive time deterministically.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_us(&self) -> u64 {
        date_time::current_timestamp_micros()
    }
}

/// Manually advanced clock for tests and simulation.
#[derive(Debug, Default)]
pub struct SettableClock {
    now_us: AtomicU64,
}

impl SettableClock {
    pub fn new(start_us: u64) -> Arc<Self> {
        Arc::new(SettableClock {
            now_us: AtomicU64::new(start_us),
        })
    }

    pub fn set(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for SettableClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::clock::{Clock, SettableClock};

    #[test]
    pub fn settable_clock_test() {
        let clock = SettableClock::new(100);
        assert_eq!(clock.now_us(), 100);
        clock.advance(50);
        assert_eq!(clock.now_us(), 150);
        clock.set(1_000_000);
        assert_eq!(clock.now_us(), 1_000_000);
    }
}
