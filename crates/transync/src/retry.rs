//! Exponential backoff shared by ingestion and sync.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Attempts per unit of work, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, max_attempts: u32) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            max_attempts: max_attempts.max(1),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before retry number `retry` (1 is the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    pub async fn wait(&self, retry: u32) {
        let delay = self.delay(retry);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default(), 4)
    }
}
