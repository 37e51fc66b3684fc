//! Exponential backoff with optional jitter

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff state for one retry loop
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts made so far
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, without jitter
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms.max(self.config.initial_delay_ms) as f64;
        let exp = i32::try_from(self.attempt.min(64)).unwrap_or(64);
        let delay = (initial * self.config.multiplier.max(1.0).powi(exp)).min(max);
        Duration::from_millis(delay as u64)
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }

    /// Sleep for the next delay
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
