//! Sliding-window rate limiting for transport ingress.
//!
//! Per-key request timestamps trimmed on access: amortized O(1) per
//! request, and `remaining`/`reset_at` fall straight out of the window
//! contents. Four preconfigured families share the transport paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::domain::models::config::{RateLimitConfig, RateLimitFamilies};

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window (after this one, if allowed)
    pub remaining: u32,
    /// When the oldest in-window request expires
    pub reset_at: DateTime<Utc>,
    /// Seconds a denied caller should wait before retrying
    pub retry_after_secs: u64,
}

/// Sliding-window limiter keyed by client identity.
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: u32,
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms.max(1)),
            max_requests: config.max_requests.max(1),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record one request for `key`.
    pub fn allow(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let stamps = state.entry(key.to_string()).or_default();

        // Trim everything that has slid out of the window.
        while let Some(&front) = stamps.front() {
            if now.duration_since(front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if (stamps.len() as u32) < self.max_requests {
            stamps.push_back(now);
            let oldest = *stamps.front().expect("just pushed");
            let until_reset = self.window.saturating_sub(now.duration_since(oldest));
            RateDecision {
                allowed: true,
                remaining: self.max_requests - stamps.len() as u32,
                reset_at: Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_default(),
                retry_after_secs: 0,
            }
        } else {
            let oldest = *stamps.front().expect("window is full");
            let until_reset = self.window.saturating_sub(now.duration_since(oldest));
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_default(),
                // Round up so callers never retry a hair too early.
                retry_after_secs: until_reset.as_secs() + u64::from(until_reset.subsec_nanos() > 0),
            }
        }
    }

    /// Drop all recorded requests for every key.
    #[doc(hidden)]
    pub fn reset_for_tests(&self) {
        self.state.lock().expect("limiter lock poisoned").clear();
    }
}

/// The four preconfigured limiter families shared by transport ingress.
pub struct LimiterSet {
    pub general: SlidingWindowLimiter,
    pub api: SlidingWindowLimiter,
    pub upload: SlidingWindowLimiter,
    pub task_start: SlidingWindowLimiter,
}

impl LimiterSet {
    pub fn new(families: &RateLimitFamilies) -> Self {
        Self {
            general: SlidingWindowLimiter::new(&families.general),
            api: SlidingWindowLimiter::new(&families.api),
            upload: SlidingWindowLimiter::new(&families.upload),
            task_start: SlidingWindowLimiter::new(&families.task_start),
        }
    }
}

impl Default for LimiterSet {
    fn default() -> Self {
        Self::new(&RateLimitFamilies::default())
    }
}
