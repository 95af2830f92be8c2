//! Exponential backoff shared by broker operations and record retries.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) ± 25% jitter

use crate::config::RetryPolicyConfig;
use std::time::Duration;

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 30s)
    pub max_delay: Duration,
    /// Maximum number of retries (default: 10)
    pub max_retries: u32,
    /// Whether to add jitter (randomness) to delays (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl From<&RetryPolicyConfig> for RetryConfig {
    fn from(policy: &RetryPolicyConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(policy.base_delay_ms),
            max_delay: Duration::from_millis(policy.max_delay_ms),
            max_retries: policy.max_retries,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Create a config tuned for broker poll/commit operations.
    pub fn for_kafka() -> Self {
        Self::default()
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }

    /// Whether another attempt is allowed after `retries` retries.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_from_policy() {
        let policy = RetryPolicyConfig {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 400,
            jitter: false,
        };
        let config = RetryConfig::from(&policy);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(50));
        assert_eq!(config.max_delay, Duration::from_millis(400));
        assert!(!config.jitter);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(10), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(750), "delay {:?} too short", delay);
        assert!(delay <= Duration::from_millis(1250), "delay {:?} too long", delay);
    }

    #[test]
    fn test_allows_retry() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(1), 3);
        assert!(config.allows_retry(0));
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));
    }
}
