//! Pending session requests

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::capabilities::Capabilities;
use super::session::Session;

/// Unique identifier of a queued new-session request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A new-session request while it waits in the queue
///
/// Carries the desired-capability alternatives in preference order and the
/// deadline after which the queue must not hand it out any more.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub id: RequestId,
    pub alternatives: Vec<Capabilities>,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

impl SessionRequest {
    pub fn new(alternatives: Vec<Capabilities>, timeout: Duration) -> Self {
        let enqueued_at = Instant::now();
        Self {
            id: RequestId::new(),
            alternatives,
            enqueued_at,
            deadline: enqueued_at + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Successful answer to a new-session request
#[derive(Debug, Clone)]
pub struct CreateSessionResponse {
    pub session: Session,
}

impl CreateSessionResponse {
    /// The wire envelope: `{"value": {"sessionId": ..., "capabilities": ...}}`
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "value": {
                "sessionId": self.session.id,
                "capabilities": self.session.capabilities,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_is_enqueue_plus_timeout() {
        let request = SessionRequest::new(
            vec![Capabilities::new().with("browserName", "chrome")],
            Duration::from_secs(10),
        );

        assert!(!request.is_expired());
        assert_eq!(request.deadline - request.enqueued_at, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_expires_immediately() {
        let request = SessionRequest::new(
            vec![Capabilities::new().with("browserName", "chrome")],
            Duration::ZERO,
        );
        assert!(request.is_expired());
    }
}
