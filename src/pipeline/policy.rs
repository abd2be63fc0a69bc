//! Timeout and retry policy for provider stages.

use crate::config::StagePolicyConfig;
use crate::providers::ProviderError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl StagePolicy {
    pub fn from_config(config: &StagePolicyConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// How long to wait before retrying after failed attempt number
    /// `attempt` (1-based), or `None` when the error should be returned.
    pub fn retry_after(&self, error: &ProviderError, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries || !error.is_transient() {
            return None;
        }
        Some(self.backoff * attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StagePolicy {
        StagePolicy {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_linear_backoff_until_retries_run_out() {
        let err = ProviderError::Network("reset".into());
        assert_eq!(policy().retry_after(&err, 1), Some(Duration::from_millis(100)));
        assert_eq!(policy().retry_after(&err, 2), Some(Duration::from_millis(200)));
        assert_eq!(policy().retry_after(&err, 3), None);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let err = ProviderError::Api {
            provider: "openai".into(),
            status: 400,
            message: "bad audio".into(),
        };
        assert_eq!(policy().retry_after(&err, 1), None);
    }

    #[test]
    fn test_from_config() {
        let policy = StagePolicy::from_config(&StagePolicyConfig {
            timeout_secs: 20,
            max_retries: 1,
            backoff_ms: 250,
        });
        assert_eq!(policy.timeout, Duration::from_secs(20));
        assert_eq!(policy.backoff, Duration::from_millis(250));
    }
}
