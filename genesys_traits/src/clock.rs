use std::thread;
use std::time::{Duration, Instant};

/// Monotonic clock abstraction used for settle delays and status polling.
///
/// - now(): returns a monotonic Instant
/// - sleep(): sleeps for the provided duration (implementations may simulate)
/// - sleep_ms(): the fixed millisecond delays used between status polls
/// - ms_since(): helper to compute elapsed milliseconds from an epoch Instant
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    #[inline]
    fn sleep_ms(&self, ms: u64) {
        self.sleep(Duration::from_millis(ms));
    }

    /// Milliseconds elapsed since `epoch`, saturating at 0 on underflow.
    fn ms_since(&self, epoch: Instant) -> u64 {
        let dur = self.now().saturating_duration_since(epoch);
        dur.as_millis() as u64
    }
}

/// Default, real-time monotonic clock backed by std::time::Instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
    fn sleep(&self, d: Duration) {
        (**self).sleep(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Clock whose time only moves when slept on.
    struct SteppedClock {
        origin: Instant,
        offset: Cell<Duration>,
    }

    impl Clock for SteppedClock {
        fn now(&self) -> Instant {
            self.origin + self.offset.get()
        }
        fn sleep(&self, d: Duration) {
            self.offset.set(self.offset.get() + d);
        }
    }

    #[test]
    fn sleep_ms_advances_by_whole_milliseconds() {
        let clock = SteppedClock {
            origin: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        };
        let epoch = clock.now();
        clock.sleep_ms(100);
        clock.sleep_ms(250);
        assert_eq!(clock.ms_since(epoch), 350);
    }

    #[test]
    fn ms_since_saturates_for_future_epoch() {
        let clock = SteppedClock {
            origin: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        };
        let future = clock.now() + Duration::from_secs(5);
        assert_eq!(clock.ms_since(future), 0);
    }

    #[test]
    fn monotonic_zero_sleep_returns_immediately() {
        let clock = MonotonicClock::new();
        let before = clock.now();
        clock.sleep(Duration::ZERO);
        assert!(clock.ms_since(before) < 50);
    }
}
