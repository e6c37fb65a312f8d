//! Rate Limiting
//!
//! Per-key fixed-window limiter used for creation limits, inbound message
//! rates and action rates. Over-limit requests are rejected outright, not
//! queued.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Window state for one key.
#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window rate limiter: at most `points` consumptions per `window`
/// per key.
#[derive(Debug)]
pub struct RateLimiter {
    points: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Allow `points` consumptions per `window` per key.
    pub fn new(points: u32, window: Duration) -> Self {
        Self {
            points,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one point for `key`. Returns false when the key is over
    /// its limit for the current window.
    pub fn try_consume(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Keep the map from growing without bound under churny keys.
        if windows.len() > 4096 {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            used: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.used = 0;
        }

        if entry.used < self.points {
            entry.used += 1;
            true
        } else {
            false
        }
    }

    /// Drop the window for a key.
    pub fn reset(&self, key: &str) {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_consume("1.2.3.4"));
        assert!(limiter.try_consume("1.2.3.4"));
        assert!(limiter.try_consume("1.2.3.4"));
        assert!(!limiter.try_consume("1.2.3.4"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_consume("a"));
        assert!(!limiter.try_consume("a"));
        assert!(limiter.try_consume("b"));
    }

    #[test]
    fn test_window_expiry_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        assert!(limiter.try_consume("a"));
        assert!(!limiter.try_consume("a"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.try_consume("a"));
    }

    #[test]
    fn test_reset_clears_key() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_consume("a"));
        limiter.reset("a");
        assert!(limiter.try_consume("a"));
    }
}
