//! Exponential backoff for reconnection

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ResilienceConfig;

/// `delay(n) = min(base * multiplier^(n-1), max)` for attempt `n`, up to `max_attempts`
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            multiplier: config.backoff_multiplier,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

/// Progress of the reconnection loop
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Failed attempts since the last success
    pub attempts: u32,
    /// A reconnection is scheduled or running
    pub is_reconnecting: bool,
    pub next_attempt_at: Option<Instant>,
    /// An attempt is executing right now
    pub in_attempt: bool,
    /// Gave up and reported it
    pub exhausted: bool,
}

impl ReconnectState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
