//! Grid configuration
//!
//! Everything tunable about the scheduling core: request timeout, retry
//! interval, health-check cadence and the registration secret shared with
//! joining nodes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on how long a new-session caller waits
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default delay before a head-inserted request is re-announced
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;

/// Default node health-check cadence
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Shared secret verified at node registration
///
/// Comparison is a straight equality check; a mismatching node is refused
/// and may simply try again with the right value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn matches(&self, other: &Secret) -> bool {
        self == other
    }
}

/// Configuration for the distributor, queue and health loop
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Deadline for a new-session request, from enqueue to response
    pub request_timeout: Duration,

    /// Delay before a retried request is re-announced on the bus
    pub retry_interval: Duration,

    /// How often the distributor polls each node's health check
    pub health_check_interval: Duration,

    /// Secret nodes must present at registration
    pub registration_secret: Secret,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            registration_secret: Secret::default(),
        }
    }
}

impl GridConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_registration_secret(mut self, secret: Secret) -> Self {
        self.registration_secret = secret;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GridConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_overrides() {
        let config = GridConfig::new()
            .with_request_timeout(Duration::from_secs(2))
            .with_retry_interval(Duration::from_millis(500))
            .with_registration_secret(Secret::new("cheddar"));

        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.retry_interval, Duration::from_millis(500));
        assert!(config.registration_secret.matches(&Secret::new("cheddar")));
    }

    #[test]
    fn test_secret_comparison() {
        assert!(Secret::new("a").matches(&Secret::new("a")));
        assert!(!Secret::new("a").matches(&Secret::new("b")));
    }
}
