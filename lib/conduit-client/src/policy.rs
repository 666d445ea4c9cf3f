//! Retry and timeout policy for one logical call

use conduit_core::ServiceEndpointConfig;
use std::time::Duration;

/// Retry policy derived from a client entry
#[derive(Clone, Debug, PartialEq)]
pub struct CallPolicy {
    /// Number of attempts, the first one included
    pub attempts: u32,
    /// Budget of a single attempt (dial and call)
    pub per_attempt_timeout: Duration,
    /// Budget of the whole call across all attempts
    pub overall_timeout: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &ServiceEndpointConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            per_attempt_timeout: config.per_attempt_timeout,
            overall_timeout: config.overall_timeout,
        }
    }

    /// Per-attempt timeout as it can actually take effect; the overall
    /// deadline always fires first when it is the shorter of the two
    pub fn effective_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout.min(self.overall_timeout)
    }

    /// Timer to put on the next attempt given what is left of the overall
    /// budget. `None` when the attempt would outlive the overall deadline
    /// anyway, so only one timer is armed and the overall timeout wins ties.
    pub fn attempt_budget(&self, remaining: Duration) -> Option<Duration> {
        if self.per_attempt_timeout < remaining {
            Some(self.per_attempt_timeout)
        } else {
            None
        }
    }

    pub fn overall_timeout_ms(&self) -> u64 {
        self.overall_timeout.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::Protocol;

    #[test]
    fn test_policy_from_config() {
        let config = ServiceEndpointConfig::new_static("svc", Protocol::Rpc, vec!["a:1".into()])
            .with_retry(3, Duration::from_millis(100), Duration::from_millis(1000));
        let policy = CallPolicy::from_config(&config);
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.effective_attempt_timeout(), Duration::from_millis(100));
        assert_eq!(policy.overall_timeout_ms(), 1000);
    }

    #[test]
    fn test_attempt_timeout_capped_by_overall() {
        let config = ServiceEndpointConfig::new_static("svc", Protocol::Rpc, vec!["a:1".into()])
            .with_retry(2, Duration::from_secs(5), Duration::from_millis(500));
        let policy = CallPolicy::from_config(&config);
        assert_eq!(policy.effective_attempt_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_attempt_budget_yields_to_overall_deadline() {
        let config = ServiceEndpointConfig::new_static("svc", Protocol::Rpc, vec!["a:1".into()])
            .with_retry(3, Duration::from_millis(100), Duration::from_millis(1000));
        let policy = CallPolicy::from_config(&config);
        assert_eq!(
            policy.attempt_budget(Duration::from_millis(900)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(policy.attempt_budget(Duration::from_millis(100)), None);
        assert_eq!(policy.attempt_budget(Duration::from_millis(40)), None);
    }
}
