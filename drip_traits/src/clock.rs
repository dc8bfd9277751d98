use std::thread;
use std::time::{Duration, Instant};

/// Time source for the sampler, the monitor pacing and the watchdog.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    /// Milliseconds elapsed since `epoch`, saturating at 0.
    fn ms_since(&self, epoch: Instant) -> u64 {
        self.now().saturating_duration_since(epoch).as_millis() as u64
    }

    /// Reading timestamp: a 32-bit millisecond counter that wraps after
    /// ~49.7 days, like the device tick it stands in for.
    fn tick_ms(&self, epoch: Instant) -> u32 {
        (self.ms_since(epoch) & u64::from(u32::MAX)) as u32
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }
}

pub mod test_clock {
    use super::{Clock, Duration, Instant};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually driven clock. `sleep` advances time instead of blocking, and
    /// clones share one timeline, so a loop under test and the test body see
    /// the same instant.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        offset_us: Arc<AtomicU64>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset_us: Arc::new(AtomicU64::new(0)),
            }
        }

        pub fn advance(&self, d: Duration) {
            let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
            // fetch_update never fails with a closure that always returns Some
            let _ = self
                .offset_us
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                    Some(cur.saturating_add(us))
                });
        }

        /// Jump to an absolute offset from the origin.
        pub fn set_offset(&self, d: Duration) {
            let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
            self.offset_us.store(us, Ordering::Release);
        }

        pub fn elapsed(&self) -> Duration {
            Duration::from_micros(self.offset_us.load(Ordering::Acquire))
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.origin + self.elapsed()
        }

        fn sleep(&self, d: Duration) {
            self.advance(d);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn clones_share_one_timeline() {
            let clock = TestClock::new();
            let other = clock.clone();
            let epoch = clock.now();
            other.sleep(Duration::from_millis(250));
            assert_eq!(clock.ms_since(epoch), 250);
            assert_eq!(clock.tick_ms(epoch), 250);
        }

        #[test]
        fn tick_wraps_like_a_32_bit_counter() {
            let clock = TestClock::new();
            let epoch = clock.now();
            clock.set_offset(Duration::from_millis(u64::from(u32::MAX) + 11));
            assert_eq!(clock.tick_ms(epoch), 10);
        }
    }
}
