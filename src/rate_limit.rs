//! Per-user token-bucket rate limiting for mention Q&A.
//!
//! Entirely in-memory: windows trim on every check and are discarded on
//! restart, which is fine since a reset rate limit is benign.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A single user's sliding request window.
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    requests: VecDeque<Instant>,
    window: Duration,
    max_requests: u32,
}

impl RateLimitWindow {
    pub fn new(window_seconds: u64, max_requests: u32) -> Self {
        Self {
            requests: VecDeque::new(),
            window: Duration::from_secs(window_seconds),
            max_requests,
        }
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&oldest) = self.requests.front() {
            if now.duration_since(oldest) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Attempt to record a request at `now`. Returns `Ok(())` if allowed,
    /// or `Err(seconds_until_reset)` if the window is exhausted.
    fn check(&mut self, now: Instant) -> Result<(), u64> {
        self.trim(now);
        if self.requests.len() >= self.max_requests as usize {
            let oldest = *self.requests.front().expect("len >= max_requests > 0 implies non-empty");
            let reset_at = oldest + self.window;
            let remaining = reset_at.saturating_duration_since(now).as_secs().max(1);
            return Err(remaining);
        }
        self.requests.push_back(now);
        Ok(())
    }
}

/// A keyed collection of [`RateLimitWindow`]s, one per (user, feature).
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateLimitWindow>>,
    window_seconds: u64,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(window_seconds: u64, max_requests: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_seconds,
            max_requests,
        }
    }

    /// Checks and, if allowed, consumes one request from `key`'s window.
    /// Returns `Err(seconds_until_reset)` when the caller should be told
    /// to wait.
    pub async fn check(&self, key: &str) -> Result<(), u64> {
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| RateLimitWindow::new(self.window_seconds, self.max_requests));
        window.check(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects_with_positive_reset() {
        let mut window = RateLimitWindow::new(60, 5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(window.check(now).is_ok());
        }
        let remaining = window.check(now).unwrap_err();
        assert!(remaining > 0);
    }

    #[test]
    fn resets_after_window_elapses() {
        let mut window = RateLimitWindow::new(1, 1);
        let t0 = Instant::now();
        assert!(window.check(t0).is_ok());
        assert!(window.check(t0).is_err());
        let later = t0 + Duration::from_secs(2);
        assert!(window.check(later).is_ok());
    }

    #[tokio::test]
    async fn rate_limiter_keys_windows_independently_per_user() {
        let limiter = RateLimiter::new(60, 1);
        assert!(limiter.check("U1").await.is_ok());
        assert!(limiter.check("U1").await.is_err());
        assert!(limiter.check("U2").await.is_ok());
    }
}
