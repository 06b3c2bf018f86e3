//! Fixed-interval request throttle shared by every worker of a crawl session.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Allows at most `per_second` acquisitions per second across all callers.
///
/// Each caller reserves the next free slot under the lock and then sleeps
/// until that slot outside of it, so waiting callers never hold up the
/// reservation of others.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `per_second == 0` disables throttling.
    pub fn per_second(per_second: u32) -> Self {
        let interval = if per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / per_second
        };
        Self::with_interval(interval)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Blocks until the caller may issue one request.
    pub fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter throttling request");
            thread::sleep(wait);
        }
    }

    /// Reserves the next slot at or after `now`, returning how long to wait for it.
    fn reserve(&self, now: Instant) -> Duration {
        // A poisoned lock only means another worker panicked mid-reservation; the
        // slot value itself is always consistent.
        let mut next_slot = match self.next_slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = match *next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next_slot = Some(slot + self.interval);
        slot.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::RateLimiter;

    #[test]
    fn reservations_are_spaced_by_interval() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(100));
        let now = Instant::now();
        assert_eq!(limiter.reserve(now), Duration::ZERO);
        assert_eq!(limiter.reserve(now), Duration::from_millis(100));
        assert_eq!(limiter.reserve(now), Duration::from_millis(200));
        // An idle gap resets the schedule instead of banking credit.
        let later = now + Duration::from_secs(5);
        assert_eq!(limiter.reserve(later), Duration::ZERO);
    }

    #[test]
    fn zero_rate_disables_throttling() {
        let limiter = RateLimiter::per_second(0);
        let started = Instant::now();
        for _ in 0..100 {
            limiter.acquire();
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn concurrent_callers_never_exceed_rate() {
        let limiter = Arc::new(RateLimiter::per_second(20));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handles = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let stamps = Arc::clone(&stamps);
                thread::spawn(move || {
                    for _ in 0..3 {
                        limiter.acquire();
                        stamps.lock().expect("stamps").push(Instant::now());
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let mut stamps = stamps.lock().expect("stamps").clone();
        stamps.sort();
        assert_eq!(stamps.len(), 12);
        // 12 calls at 20/s need at least 11 intervals of 50ms; allow scheduler jitter.
        let span = stamps[11].duration_since(stamps[0]);
        assert!(span >= Duration::from_millis(500), "span was {span:?}");
    }
}
