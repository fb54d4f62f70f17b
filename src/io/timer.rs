use std::time::{Duration, Instant};

/// A repeating timer driven by the I/O loop.
#[derive(Debug)]
pub(crate) struct Interval {
    next: Instant,
    period: Duration,
}

impl Interval {
    /// Create a timer that first fires after `delay`, then every `period`.
    pub(crate) fn new(delay: Duration, period: Duration) -> Self {
        Self {
            next: Instant::now() + delay,
            period,
        }
    }

    /// Time left until the timer fires next.
    pub(crate) fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Check whether the timer has fired and, if so, schedule the next time.
    ///
    /// Ticks missed while the loop was busy are not made up for.
    pub(crate) fn tick(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }

        self.next += self.period;

        if self.next <= now {
            self.next = now + self.period;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_delay_then_every_period() {
        let mut interval = Interval::new(Duration::ZERO, Duration::from_secs(1));
        let start = Instant::now();

        assert!(interval.tick(start));
        assert!(!interval.tick(start));
        assert!(interval.remaining(start) <= Duration::from_secs(1));
        assert!(interval.tick(start + Duration::from_secs(1)));
    }

    #[test]
    fn missed_ticks_are_skipped() {
        let mut interval = Interval::new(Duration::ZERO, Duration::from_secs(1));
        let start = Instant::now();

        assert!(interval.tick(start + Duration::from_secs(10)));
        assert!(!interval.tick(start + Duration::from_secs(10)));
    }
}
