//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Tracks consecutive connection failures and yields the next retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Consecutive failures since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt; advances the failure count.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.calculate_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `initial_delay * multiplier^attempt`, capped at `max_delay`, plus up to
    /// `jitter` of that as random extra delay.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter_range = delay * self.config.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::random::<f64>() * jitter_range
        } else {
            0.0
        };
        Duration::from_secs_f64(delay + jitter)
    }

    /// Delay in seconds before jitter.
    fn base_delay(&self, attempt: u32) -> f64 {
        let initial = self.config.initial_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = initial * self.config.multiplier.max(1.0).powi(exponent);
        if delay.is_finite() {
            delay.min(max)
        } else {
            max
        }
    }
}
