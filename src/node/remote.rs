//! Remote node proxy
//!
//! Nodes that register over HTTP are wrapped in a proxy implementing the
//! same [`Node`](super::Node) contract as in-process nodes, so the
//! scheduler never knows the difference. Slot accounting on this side is a
//! cache of the node's last reported status: it is updated optimistically
//! on placement and stop, and authoritatively on every health probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Secret;
use crate::data::{
    Capabilities, NewSessionPayload, NodeId, NodeStatus, Session, SessionId, SlotState,
};
use crate::events::{EventBus, GridEvent};

use super::{HealthReport, Node, NodeError, PlacementError};

const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire payload a node sends to join the grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub secret: Secret,
    pub status: NodeStatus,
}

pub struct RemoteNode {
    secret: Secret,
    bus: Arc<dyn EventBus>,
    client: reqwest::Client,
    status: Mutex<NodeStatus>,
    draining: AtomicBool,
    removed: AtomicBool,
}

impl RemoteNode {
    pub fn new(bus: Arc<dyn EventBus>, registration: NodeRegistration) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        let draining = registration.status.draining;
        Arc::new(Self {
            secret: registration.secret,
            bus,
            client,
            status: Mutex::new(registration.status),
            draining: AtomicBool::new(draining),
            removed: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.uri();
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    /// Optimistically bind `session` to a free matching slot in the cached
    /// status. The next status probe replaces this with what the node
    /// actually reports.
    fn record_session(&self, session: &Session) {
        let mut status = self.status.lock();
        if let Some(slot) = status
            .slots
            .iter_mut()
            .find(|s| s.is_free() && s.stereotype.matches(&session.stereotype))
        {
            slot.state = SlotState::Active;
            slot.session_id = Some(session.id);
            slot.last_started = Some(session.started_at);
        }
    }

    fn record_stop(&self, session_id: SessionId) {
        let mut status = self.status.lock();
        if let Some(slot) = status
            .slots
            .iter_mut()
            .find(|s| s.session_id == Some(session_id))
        {
            slot.state = SlotState::Free;
            slot.session_id = None;
        }
    }

    fn remove_if_drained_and_empty(&self) {
        if !self.is_draining() {
            return;
        }
        let empty = self
            .status
            .lock()
            .slots
            .iter()
            .all(|slot| slot.state == SlotState::Free);
        if empty && !self.removed.swap(true, Ordering::SeqCst) {
            self.bus.fire(GridEvent::NodeRemoved(self.id()));
        }
    }

    fn placement_error_from(value: &Value, fallback: &str) -> PlacementError {
        match value["value"]["error"].as_str() {
            Some("no capacity") => PlacementError::NoCapacity,
            Some("no match") => PlacementError::NoMatch,
            Some("draining") => PlacementError::Draining,
            _ => PlacementError::FactoryFailed(fallback.to_string()),
        }
    }
}

#[async_trait]
impl Node for RemoteNode {
    fn id(&self) -> NodeId {
        self.status.lock().node_id
    }

    fn uri(&self) -> String {
        self.status.lock().uri.clone()
    }

    fn registration_secret(&self) -> Secret {
        self.secret.clone()
    }

    async fn new_session(&self, requested: &Capabilities) -> Result<Session, PlacementError> {
        if self.is_draining() {
            return Err(PlacementError::Draining);
        }

        let url = self.endpoint("/se/grid/node/session");
        let payload = NewSessionPayload::single(requested.clone());
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PlacementError::FactoryFailed(e.to_string()))?;

        let http_status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PlacementError::FactoryFailed(e.to_string()))?;

        if !http_status.is_success() {
            return Err(Self::placement_error_from(
                &body,
                &format!("node answered HTTP {http_status}"),
            ));
        }

        let value = &body["value"];
        let session_id: SessionId = value["sessionId"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                PlacementError::FactoryFailed("node answered without a session id".to_string())
            })?;
        let capabilities: Capabilities =
            serde_json::from_value(value["capabilities"].clone()).unwrap_or_default();
        let uri = value["uri"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.uri());

        let session = Session {
            id: session_id,
            node_id: self.id(),
            stereotype: requested.clone(),
            capabilities,
            started_at: chrono::Utc::now(),
            uri,
        };
        self.record_session(&session);
        Ok(session)
    }

    async fn stop(&self, session_id: SessionId) -> Result<(), NodeError> {
        let url = self.endpoint(&format!("/se/grid/node/session/{session_id}"));
        match self.client.delete(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                return Err(NodeError::SessionNotFound(session_id));
            }
            Ok(_) => {}
            Err(e) => {
                // The node may already be gone; free the cached slot anyway.
                warn!(%session_id, error = %e, "failed to reach remote node for stop");
            }
        }

        self.record_stop(session_id);
        self.bus.fire(GridEvent::SessionClosed {
            session_id,
            node_id: self.id(),
        });
        self.remove_if_drained_and_empty();
        Ok(())
    }

    fn drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            {
                let mut status = self.status.lock();
                status.draining = true;
            }
            self.bus.fire(GridEvent::NodeDrainStarted(self.id()));

            let client = self.client.clone();
            let url = self.endpoint("/se/grid/node/drain");
            tokio::spawn(async move {
                if let Err(e) = client.post(&url).send().await {
                    warn!(error = %e, "failed to forward drain to remote node");
                }
            });
            self.remove_if_drained_and_empty();
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn status(&self) -> NodeStatus {
        self.status.lock().clone()
    }

    async fn health_check(&self) -> HealthReport {
        let url = self.endpoint("/status");
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                // A reachable node also refreshes our slot cache.
                if let Ok(mut reported) = response.json::<NodeStatus>().await {
                    reported.draining = reported.draining || self.is_draining();
                    *self.status.lock() = reported;
                    debug!(node_id = %self.id(), "refreshed remote node status");
                }
                self.remove_if_drained_and_empty();
                HealthReport::up(format!("{} is reachable", url))
            }
            Ok(response) => {
                HealthReport::down(format!("{} answered HTTP {}", url, response.status()))
            }
            Err(e) => HealthReport::down(format!("{} is unreachable: {}", url, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Availability, SlotId, SlotStatus};
    use crate::events::LocalEventBus;

    fn registration(draining: bool) -> NodeRegistration {
        NodeRegistration {
            secret: Secret::new("cheddar"),
            status: NodeStatus {
                node_id: NodeId::new(),
                uri: "http://node.example:5555".to_string(),
                availability: Availability::Up,
                draining,
                max_session_count: 1,
                slots: vec![SlotStatus {
                    id: SlotId::new(),
                    stereotype: Capabilities::new().with("browserName", "chrome"),
                    state: SlotState::Free,
                    session_id: None,
                    last_started: None,
                }],
            },
        }
    }

    #[tokio::test]
    async fn test_proxy_reflects_registration_status() {
        let node = RemoteNode::new(LocalEventBus::new(), registration(false));

        assert_eq!(node.uri(), "http://node.example:5555");
        assert!(!node.is_draining());
        assert_eq!(node.status().free_slot_count(), 1);
        assert!(node.registration_secret().matches(&Secret::new("cheddar")));
    }

    #[tokio::test]
    async fn test_draining_proxy_refuses_placement_without_network() {
        let node = RemoteNode::new(LocalEventBus::new(), registration(true));
        let err = node
            .new_session(&Capabilities::new().with("browserName", "chrome"))
            .await
            .unwrap_err();
        assert_eq!(err, PlacementError::Draining);
    }

    #[test]
    fn test_placement_error_mapping() {
        let body = serde_json::json!({"value": {"error": "no capacity"}});
        assert_eq!(
            RemoteNode::placement_error_from(&body, "x"),
            PlacementError::NoCapacity
        );

        let body = serde_json::json!({"value": {"error": "draining"}});
        assert_eq!(
            RemoteNode::placement_error_from(&body, "x"),
            PlacementError::Draining
        );

        let body = serde_json::json!({"value": {}});
        assert!(matches!(
            RemoteNode::placement_error_from(&body, "backend gone"),
            PlacementError::FactoryFailed(m) if m == "backend gone"
        ));
    }
}
