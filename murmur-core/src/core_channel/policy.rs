//! Reconnect policy applied when a push connection drops

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Reconnect after a fixed delay, indefinitely
    PersistentRetry {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Give up on push after the first close or error and hand over to polling
    FailFastToFallback,
}

impl ReconnectPolicy {
    pub fn persistent(delay: Duration) -> Self {
        ReconnectPolicy::PersistentRetry { delay }
    }

    /// Delay before the next attempt, `None` if the policy never retries
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            ReconnectPolicy::PersistentRetry { delay } => Some(*delay),
            ReconnectPolicy::FailFastToFallback => None,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::FailFastToFallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: ReconnectPolicy,
        }

        let w: Wrapper = toml::from_str("policy = { kind = \"persistent_retry\", delay = \"3s\" }").unwrap();
        assert_eq!(w.policy.retry_delay(), Some(Duration::from_secs(3)));

        let w: Wrapper = toml::from_str("policy = { kind = \"fail_fast_to_fallback\" }").unwrap();
        assert_eq!(w.policy, ReconnectPolicy::FailFastToFallback);
    }
}
