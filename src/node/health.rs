//! Pluggable node health checks
//!
//! The distributor polls each node's health check on a fixed cadence and
//! reconciles availability from the answer. The default check always
//! reports up; remote nodes probe their status endpoint over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::data::Availability;

/// Outcome of one health check: availability plus a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub availability: Availability,
    pub message: String,
}

impl HealthReport {
    pub fn up(message: impl Into<String>) -> Self {
        Self {
            availability: Availability::Up,
            message: message.into(),
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            availability: Availability::Down,
            message: message.into(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.availability == Availability::Up
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthReport;
}

/// Default health check: the node is reachable in-process, so it is up
pub struct AlwaysUp;

#[async_trait]
impl HealthCheck for AlwaysUp {
    async fn check(&self) -> HealthReport {
        HealthReport::up("ok")
    }
}

/// Health check with an externally settable answer
///
/// Useful in tests and for operator overrides: flip a node down without
/// unregistering it, flip it back up and let the next reconciliation pass
/// pick it up.
pub struct SettableHealthCheck {
    report: Mutex<HealthReport>,
}

impl SettableHealthCheck {
    pub fn new(report: HealthReport) -> Arc<Self> {
        Arc::new(Self {
            report: Mutex::new(report),
        })
    }

    pub fn set(&self, report: HealthReport) {
        *self.report.lock() = report;
    }
}

#[async_trait]
impl HealthCheck for SettableHealthCheck {
    async fn check(&self) -> HealthReport {
        self.report.lock().clone()
    }
}

/// HTTP probe against a node's status endpoint
///
/// Any 2xx answer within the timeout counts as up; everything else, from a
/// non-success status to a connection error, reports down with the cause.
pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthCheck {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self) -> HealthReport {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => {
                HealthReport::up(format!("{} is reachable", self.url))
            }
            Ok(response) => HealthReport::down(format!(
                "{} answered HTTP {}",
                self.url,
                response.status()
            )),
            Err(e) => HealthReport::down(format!("{} is unreachable: {}", self.url, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_up() {
        let report = AlwaysUp.check().await;
        assert!(report.is_up());
    }

    #[tokio::test]
    async fn test_settable_check_flips() {
        let check = SettableHealthCheck::new(HealthReport::down("booting"));
        assert!(!check.check().await.is_up());

        check.set(HealthReport::up("warmed up"));
        let report = check.check().await;
        assert!(report.is_up());
        assert_eq!(report.message, "warmed up");
    }
}
