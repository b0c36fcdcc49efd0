//! Sliding-window rate limiter keyed by provider or action name

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::RateLimitError;

/// Admission limit for one key: `limit` calls per `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: usize,
    pub window_secs: u64,
}

impl RateLimit {
    pub fn new(limit: usize, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-provider defaults, overridden key by key from configuration
pub fn default_limits() -> HashMap<String, RateLimit> {
    [
        ("gemini", RateLimit::new(100, 60)),
        ("anthropic", RateLimit::new(50, 60)),
        ("openai", RateLimit::new(60, 60)),
        ("ollama", RateLimit::new(1000, 60)),
    ]
    .into_iter()
    .map(|(key, limit)| (key.to_string(), limit))
    .collect()
}

/// Current usage of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateStats {
    pub used: usize,
    pub limit: Option<usize>,
    pub window: Duration,
}

/// Process-wide admission control, shared behind an `Arc`
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    limits: HashMap<String, RateLimit>,
    windows: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl RateLimiter {
    /// Limiter with the default provider limits and the given clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            limits: default_limits(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Merge configured limits over the defaults
    pub fn with_limits(mut self, limits: HashMap<String, RateLimit>) -> Self {
        self.limits.extend(limits);
        self
    }

    pub fn limit_for(&self, key: &str) -> Option<RateLimit> {
        self.limits.get(key).copied()
    }

    /// Admit one call for `key` or report how long to wait.
    ///
    /// Timestamps at or before `now - window` are purged first. A rejected
    /// call is not recorded.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let stamps = windows.entry(key.to_string()).or_default();

        while let Some(oldest) = stamps.front() {
            if now.saturating_sub(*oldest) >= window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= limit {
            let retry_after = match stamps.front() {
                Some(oldest) => window.saturating_sub(now.saturating_sub(*oldest)),
                None => window,
            };
            warn!(
                "Rate limit hit for '{}' ({}/{} in {:?}), retry after {:?}",
                key,
                stamps.len(),
                limit,
                window,
                retry_after
            );
            return Err(RateLimitError {
                key: key.to_string(),
                retry_after,
            });
        }

        stamps.push_back(now);
        debug!("Rate limit '{}': {}/{}", key, stamps.len(), limit);
        Ok(())
    }

    /// Check against the configured limit for `key`; unconfigured keys are admitted
    pub fn check_key(&self, key: &str) -> Result<(), RateLimitError> {
        match self.limit_for(key) {
            Some(limit) => self.check(key, limit.limit, limit.window()),
            None => {
                debug!("No rate limit configured for '{}', admitting", key);
                Ok(())
            }
        }
    }

    pub fn stats(&self, key: &str) -> RateStats {
        let limit = self.limit_for(key);
        let window = limit.map(|l| l.window()).unwrap_or(Duration::from_secs(60));
        let now = self.clock.now();
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let used = windows
            .get(key)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|t| now.saturating_sub(**t) < window)
                    .count()
            })
            .unwrap_or(0);
        RateStats {
            used,
            limit: limit.map(|l| l.limit),
            window,
        }
    }

    /// Keys with a configured limit, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.limits.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }
}

/// Exponential backoff for rate-limit and retryable provider failures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `base * multiplier^attempt`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Backoff for `attempt`, raised to the server's retry-after hint when larger
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempt);
        match hint {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_limit_then_reject_then_recover() {
        let (clock, limiter) = limiter();
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            assert!(limiter.check("k", 3, window).is_ok());
            clock.advance(Duration::from_secs(1));
        }
        let err = limiter.check("k", 3, window).unwrap_err();
        assert_eq!(err.key, "k");
        assert!(err.retry_after > Duration::ZERO);
        // oldest at t=0, now t=3
        assert_eq!(err.retry_after, Duration::from_secs(57));

        clock.advance(Duration::from_secs(57));
        assert!(limiter.check("k", 3, window).is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(10);
        assert!(limiter.check("a", 1, window).is_ok());
        assert!(limiter.check("a", 1, window).is_err());
        assert!(limiter.check("b", 1, window).is_ok());
    }

    #[test]
    fn test_rejected_call_not_recorded() {
        let (clock, limiter) = limiter();
        let window = Duration::from_secs(10);
        assert!(limiter.check("k", 1, window).is_ok());
        clock.advance(Duration::from_secs(5));
        assert!(limiter.check("k", 1, window).is_err());
        clock.advance(Duration::from_secs(5));
        assert!(limiter.check("k", 1, window).is_ok());
    }

    #[test]
    fn test_zero_limit_always_rejects() {
        let (_clock, limiter) = limiter();
        let err = limiter.check("k", 0, Duration::from_secs(30)).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(30));
    }

    #[test]
    fn test_check_key_uses_configured_limits() {
        let (_clock, limiter) = limiter();
        let limiter = limiter.with_limits(HashMap::from([("anthropic".to_string(), RateLimit::new(2, 60))]));
        assert!(limiter.check_key("anthropic").is_ok());
        assert!(limiter.check_key("anthropic").is_ok());
        assert!(limiter.check_key("anthropic").is_err());
        // unconfigured key is admitted
        for _ in 0..10 {
            assert!(limiter.check_key("custom").is_ok());
        }
        assert_eq!(limiter.limit_for("openai"), Some(RateLimit::new(60, 60)));
    }

    #[test]
    fn test_stats() {
        let (clock, limiter) = limiter();
        limiter.check_key("gemini").unwrap();
        limiter.check_key("gemini").unwrap();
        let stats = limiter.stats("gemini");
        assert_eq!(stats.used, 2);
        assert_eq!(stats.limit, Some(100));
        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.stats("gemini").used, 0);
        assert_eq!(limiter.stats("unknown").limit, None);
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_honors_hint() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(100))),
            Duration::from_secs(4)
        );
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
    }
}
