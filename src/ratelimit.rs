use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub time_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            time_window_ms: 60_000,
        }
    }
}

/// Fixed-window request counter.
pub struct RateLimiter {
    max_requests: u32,
    time_window_ms: u64,
    remaining: u32,
    reset_at: u64,
    last_request_at: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            max_requests: config.max_requests,
            time_window_ms: config.time_window_ms,
            remaining: config.max_requests,
            reset_at: now.saturating_add(config.time_window_ms),
            last_request_at: None,
            clock,
        }
    }

    pub fn check_rate_limit(&mut self) -> bool {
        let now = self.clock.now_ms();

        // First call of a fresh window always passes and leaves the full budget
        if now >= self.reset_at {
            self.remaining = self.max_requests;
            self.reset_at = now.saturating_add(self.time_window_ms);
            self.last_request_at = Some(now);
            return true;
        }

        if self.remaining == 0 {
            return false;
        }

        self.remaining -= 1;
        self.last_request_at = Some(now);
        true
    }

    /// Polls [`check_rate_limit`](Self::check_rate_limit) until it passes.
    ///
    /// Never gives up on its own; wrap in `tokio::time::timeout` to bound it.
    pub async fn wait_for_rate_limit(&mut self) {
        while !self.check_rate_limit() {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub fn reset_rate_limit(&mut self) {
        self.remaining = self.max_requests;
        self.reset_at = self.clock.now_ms().saturating_add(self.time_window_ms);
        self.last_request_at = None;
    }

    /// Whether the next check would pass, without consuming anything.
    pub fn would_allow(&self) -> bool {
        self.clock.now_ms() >= self.reset_at || self.remaining > 0
    }

    pub fn retry_after_ms(&self) -> u64 {
        if self.would_allow() {
            0
        } else {
            self.reset_at.saturating_sub(self.clock.now_ms())
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset_at(&self) -> u64 {
        self.reset_at
    }

    pub fn last_request_at(&self) -> Option<u64> {
        self.last_request_at
    }
}
