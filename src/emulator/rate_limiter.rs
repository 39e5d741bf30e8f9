//! Pacing for the emulated producer

use std::thread;
use std::time::{Duration, Instant};

/// Waits just long enough between calls to hold a target rate
pub struct RateLimiter {
    /// Time between two ticks, `None` when unlimited
    period: Option<Duration>,
    /// When the next tick is due
    deadline: Instant,
}

impl RateLimiter {
    /// Sleeps above this are handed to the scheduler, shorter waits spin
    const SPIN_THRESHOLD: Duration = Duration::from_micros(100);

    /// Falling further behind than this many periods resets the schedule
    const MAX_LAG_PERIODS: u32 = 1_000;

    /// Create a limiter for `rate_khz` thousand ticks per second; zero or less is unlimited
    pub fn new(rate_khz: f64) -> Self {
        Self {
            period: Self::period_for(rate_khz),
            deadline: Instant::now(),
        }
    }

    fn period_for(rate_khz: f64) -> Option<Duration> {
        (rate_khz > 0.0 && rate_khz.is_finite())
            .then(|| Duration::from_secs_f64(1.0 / (rate_khz * 1_000.0)))
    }

    /// Change the target rate, starting the schedule afresh
    pub fn adjust(&mut self, rate_khz: f64) {
        self.period = Self::period_for(rate_khz);
        self.deadline = Instant::now();
    }

    /// Block until the next tick is due
    pub fn limit(&mut self) {
        let Some(period) = self.period else {
            return;
        };

        self.deadline += period;
        let now = Instant::now();

        if now > self.deadline {
            if now - self.deadline > period * Self::MAX_LAG_PERIODS {
                self.deadline = now;
            }
            return;
        }

        let wait = self.deadline - now;
        if wait > Self::SPIN_THRESHOLD {
            thread::sleep(wait - Self::SPIN_THRESHOLD);
        }
        while Instant::now() < self.deadline {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_rate() {
        // 10 kHz: 200 ticks take at least 20 ms
        let mut limiter = RateLimiter::new(10.0);
        let started = Instant::now();
        for _ in 0..200 {
            limiter.limit();
        }
        assert!(started.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn test_unlimited() {
        let mut limiter = RateLimiter::new(0.0);
        let started = Instant::now();
        for _ in 0..100_000 {
            limiter.limit();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_adjust() {
        let mut limiter = RateLimiter::new(0.0);
        limiter.limit();

        limiter.adjust(10.0);
        let started = Instant::now();
        for _ in 0..200 {
            limiter.limit();
        }
        assert!(started.elapsed() >= Duration::from_millis(19));

        // Back to unlimited, no backlog from the old schedule
        limiter.adjust(-1.0);
        let started = Instant::now();
        for _ in 0..100_000 {
            limiter.limit();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
