// src/engine/retry.rs
// Exponential backoff with jitter for provider stream retries

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): exponential from
    /// `base_delay`, capped at `max_delay`, with up to 25% random jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            (capped * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay)
    }
}

/// Payload of a `model_retry` event shown to the client while the engine
/// backs off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEvent {
    pub attempt: usize,
    pub max_attempts: usize,
    pub delay_seconds: f64,
    pub model: String,
    pub reason: String,
    pub error_preview: String,
}

impl RetryEvent {
    pub fn new(attempt: usize, config: &RetryConfig, delay: Duration, model: &str, error: &str) -> Self {
        let error_preview: String = error.chars().take(200).collect();
        Self {
            attempt,
            max_attempts: config.max_attempts,
            delay_seconds: delay.as_secs_f64(),
            model: model.to_string(),
            reason: "Provider error".to_string(),
            error_preview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default();
        for attempt in 1..=6 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay <= config.max_delay);
            assert!(delay >= Duration::from_millis(500));
        }
    }
}
