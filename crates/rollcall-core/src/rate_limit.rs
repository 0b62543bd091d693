//! Process-wide throttle for the recognition path.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Enforces a minimum interval between recognition calls across all callers.
///
/// Construct once per process and share it. Each `acquire` reserves the next
/// free slot under a short lock and then sleeps outside the lock, so
/// concurrent callers can never both observe a stale timestamp.
pub struct RateLimiter {
    fps_limit: f64,
    min_interval: Option<Duration>,
    last_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `fps_limit` calls per second; `0` (or any non-positive or non-finite
    /// value) disables limiting.
    pub fn new(fps_limit: f64) -> Self {
        let min_interval = if fps_limit.is_finite() && fps_limit > 0.0 {
            Duration::try_from_secs_f64(1.0 / fps_limit).ok()
        } else {
            None
        };
        Self {
            fps_limit: if min_interval.is_some() { fps_limit } else { 0.0 },
            min_interval,
            last_slot: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    /// Configured calls per second, `0.0` when unlimited.
    pub fn fps_limit(&self) -> f64 {
        self.fps_limit
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Block until the caller may proceed. Returns the time spent waiting.
    pub fn acquire(&self) -> Duration {
        let Some(interval) = self.min_interval else {
            return Duration::ZERO;
        };

        let now = Instant::now();
        let slot = {
            let mut last = self.last_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = match *last {
                Some(prev) => (prev + interval).max(now),
                None => now,
            };
            *last = Some(slot);
            slot
        };

        let wait = slot.saturating_duration_since(now);
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiting recognition");
            std::thread::sleep(wait);
        }
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = RateLimiter::new(0.0);
        for _ in 0..5 {
            assert_eq!(limiter.acquire(), Duration::ZERO);
        }
        assert!(limiter.min_interval().is_none());
        assert_eq!(limiter.fps_limit(), 0.0);
    }

    #[test]
    fn test_invalid_limit_is_unlimited() {
        assert!(RateLimiter::new(-1.0).min_interval().is_none());
        assert!(RateLimiter::new(f64::NAN).min_interval().is_none());
        assert!(RateLimiter::new(f64::INFINITY).min_interval().is_none());
    }

    #[test]
    fn test_first_call_does_not_wait() {
        let limiter = RateLimiter::new(1.0);
        assert_eq!(limiter.acquire(), Duration::ZERO);
    }

    #[test]
    fn test_back_to_back_calls_are_spaced() {
        let limiter = RateLimiter::new(2.0);
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        assert!(start.elapsed() >= Duration::from_millis(500), "{:?}", start.elapsed());
    }

    #[test]
    fn test_concurrent_callers_each_get_a_slot() {
        let limiter = Arc::new(RateLimiter::new(10.0));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.acquire())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Four slots at 100ms spacing: the last starts >= 300ms after the first.
        assert!(start.elapsed() >= Duration::from_millis(300), "{:?}", start.elapsed());
    }
}
