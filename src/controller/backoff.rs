//! Requeue delays for failed reconciles
//!
//! Each failing object backs off exponentially on its own, while a token
//! bucket shared by all objects of a kind caps the overall retry rate. The
//! delay handed to the controller is the larger of the two.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

#[derive(Debug)]
struct LimiterState {
    failures: HashMap<String, u32>,
    tokens: f64,
    last_refill: Instant,
}

/// Per-key exponential backoff combined with a shared token bucket.
#[derive(Debug)]
pub struct RetryRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    qps: f64,
    burst: f64,
    state: Mutex<LimiterState>,
}

impl Default for RetryRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl RetryRateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration, qps: f64, burst: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            qps,
            burst: f64::from(burst),
            state: Mutex::new(LimiterState {
                failures: HashMap::new(),
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Record a failure for `key` and return how long to wait before the
    /// next attempt.
    pub fn when(&self, key: &str) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let failures = state.failures.entry(key.to_string()).or_insert(0);
        let exponent = (*failures).min(31);
        *failures = failures.saturating_add(1);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last_refill = now;
        state.tokens -= 1.0;
        let bucket = if state.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        };

        backoff.max(bucket)
    }

    /// Reset the failure count of `key` after a successful reconcile.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failures.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let limiter = RetryRateLimiter::default();
        assert_eq!(limiter.when("default/web"), Duration::from_millis(200));
        assert_eq!(limiter.when("default/web"), Duration::from_millis(400));
        assert_eq!(limiter.when("default/web"), Duration::from_millis(800));
        assert_eq!(limiter.when("default/web"), Duration::from_millis(1600));
        assert_eq!(limiter.when("default/web"), Duration::from_millis(3200));
        // capped at 5s
        assert_eq!(limiter.when("default/web"), Duration::from_secs(5));
        for _ in 0..40 {
            assert_eq!(limiter.when("default/web"), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_keys_back_off_independently() {
        let limiter = RetryRateLimiter::default();
        limiter.when("default/web");
        limiter.when("default/web");
        assert_eq!(limiter.when("default/api"), Duration::from_millis(200));
        assert_eq!(limiter.failures("default/web"), 2);
        assert_eq!(limiter.failures("default/api"), 1);
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter = RetryRateLimiter::default();
        limiter.when("default/web");
        limiter.when("default/web");
        limiter.forget("default/web");
        assert_eq!(limiter.failures("default/web"), 0);
        assert_eq!(limiter.when("default/web"), Duration::from_millis(200));
    }

    #[test]
    fn test_bucket_exhaustion_delays_new_keys() {
        let limiter = RetryRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            1.0,
            2,
        );
        assert_eq!(limiter.when("a"), Duration::from_millis(1));
        assert_eq!(limiter.when("b"), Duration::from_millis(1));
        // Third request in the same instant waits for a refill.
        let delay = limiter.when("c");
        assert!(delay > Duration::from_millis(900), "delay was {:?}", delay);
        assert!(delay <= Duration::from_secs(1));
    }
}
