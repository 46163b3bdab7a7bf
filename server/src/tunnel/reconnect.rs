//! Bounded reconnect policy.
//!
//! A fixed delay before each attempt and a hard cap on attempts per
//! disconnect. The counter restarts from zero after every successful
//! reconnection, so the cap applies to consecutive failures only.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_retries: u32,
    delay: Duration,
    attempt: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            attempt: 0,
        }
    }

    /// Start a fresh series of attempts.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Claim the next attempt number (1-based), or `None` once the cap is hit.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.attempt)
    }

    /// Attempts claimed since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait before each attempt.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}
