//! Lifecycle and request events
//!
//! Loosely coupled components coordinate over a publish/subscribe bus.
//! Components hold only a handle to the bus; there are no back-edges
//! between the distributor, the queue and the nodes. Publishers never
//! block on subscribers, and subscribers observe events in fire order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::data::{NodeId, NodeStatus, RequestId, SessionId};

/// Why a queued new-session request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RejectionReason {
    /// The deadline elapsed while the request was queued
    Timeout,
    /// The queue was cleared or is shutting down
    Cancelled,
    /// No registered node advertises a matching stereotype
    Unsupported,
}

/// Events fired by the grid core
#[derive(Debug, Clone)]
pub enum GridEvent {
    /// A request is available in the new-session queue
    NewSessionRequest(RequestId),

    /// A queued request was rejected and will never be served
    NewSessionRejected {
        request_id: RequestId,
        reason: RejectionReason,
    },

    /// A node passed the registration handshake and joined the grid
    NodeAdded(NodeId),

    /// A node left the grid, voluntarily or not
    NodeRemoved(NodeId),

    /// A node stopped accepting new sessions and is waiting to empty
    NodeDrainStarted(NodeId),

    /// A node failed the registration handshake
    NodeRejected(NodeId),

    /// A session finished and its slot was released
    SessionClosed {
        session_id: SessionId,
        node_id: NodeId,
    },

    /// Periodic heartbeat snapshot of one node
    NodeStatus(NodeStatus),
}

/// Publish/subscribe contract the core components depend on
pub trait EventBus: Send + Sync {
    /// Fire an event. Never blocks; an event with no subscribers is
    /// silently dropped.
    fn fire(&self, event: GridEvent);

    /// Subscribe to all subsequent events.
    fn subscribe(&self) -> broadcast::Receiver<GridEvent>;
}

/// In-process bus backed by a single broadcast channel
///
/// One channel carries every event type, which gives per-topic ordering
/// for free: subscribers see events exactly in fire order.
pub struct LocalEventBus {
    sender: broadcast::Sender<GridEvent>,
}

impl LocalEventBus {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(256);
        Arc::new(Self { sender })
    }
}

impl EventBus for LocalEventBus {
    fn fire(&self, event: GridEvent) {
        trace!(?event, "firing grid event");
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_fire_order() {
        let bus = LocalEventBus::new();
        let mut rx = bus.subscribe();

        let first = NodeId::new();
        let second = NodeId::new();
        bus.fire(GridEvent::NodeAdded(first));
        bus.fire(GridEvent::NodeRemoved(second));

        match rx.recv().await.unwrap() {
            GridEvent::NodeAdded(id) => assert_eq!(id, first),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            GridEvent::NodeRemoved(id) => assert_eq!(id, second),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fire_without_subscribers_is_a_no_op() {
        let bus = LocalEventBus::new();
        bus.fire(GridEvent::NodeAdded(NodeId::new()));
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_every_event() {
        let bus = LocalEventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let id = RequestId::new();
        bus.fire(GridEvent::NewSessionRequest(id));

        assert!(matches!(
            a.recv().await.unwrap(),
            GridEvent::NewSessionRequest(got) if got == id
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            GridEvent::NewSessionRequest(got) if got == id
        ));
    }
}
