//! Session map
//!
//! Authoritative registry of live session-id → session descriptor. Nodes
//! announce `SessionClosed` on the bus and the map removes the entry; the
//! distributor only writes on successful placement and reads for status
//! queries.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::data::{NodeId, Session, SessionId};
use crate::events::{EventBus, GridEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionMapError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} already exists")]
    Duplicate(SessionId),
}

pub struct SessionMap {
    sessions: DashMap<SessionId, Session>,
}

impl SessionMap {
    /// Create a map that removes sessions when their node announces
    /// `SessionClosed`.
    pub fn new(bus: Arc<dyn EventBus>) -> Arc<Self> {
        let map = Arc::new(Self {
            sessions: DashMap::new(),
        });

        let mut rx = bus.subscribe();
        let weak = Arc::downgrade(&map);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(GridEvent::SessionClosed { session_id, .. }) => {
                        let Some(map) = weak.upgrade() else { break };
                        if map.sessions.remove(&session_id).is_some() {
                            debug!(%session_id, "session closed, removed from session map");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session map lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        map
    }

    /// Register a session. No two sessions may share an id.
    pub fn add(&self, session: Session) -> Result<(), SessionMapError> {
        use dashmap::mapref::entry::Entry;

        let id = session.id;
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(SessionMapError::Duplicate(id)),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: SessionId) -> Result<Session, SessionMapError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(SessionMapError::NotFound(id))
    }

    pub fn remove(&self, id: SessionId) -> Result<Session, SessionMapError> {
        self.sessions
            .remove(&id)
            .map(|(_, session)| session)
            .ok_or(SessionMapError::NotFound(id))
    }

    /// Sessions owned by one node. Used when a node is forcibly removed,
    /// to report what was left behind.
    pub fn owned_by(&self, node_id: NodeId) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.node_id == node_id)
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Capabilities;
    use crate::events::LocalEventBus;
    use chrono::Utc;
    use std::time::Duration;

    fn session(node_id: NodeId) -> Session {
        Session {
            id: SessionId::new(),
            node_id,
            stereotype: Capabilities::new().with("browserName", "chrome"),
            capabilities: Capabilities::new().with("browserName", "chrome"),
            started_at: Utc::now(),
            uri: "http://node.example:5555".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let map = SessionMap::new(LocalEventBus::new());
        let s = session(NodeId::new());
        let id = s.id;

        map.add(s).unwrap();
        assert_eq!(map.get(id).unwrap().id, id);

        map.remove(id).unwrap();
        assert!(matches!(
            map.get(id),
            Err(SessionMapError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let map = SessionMap::new(LocalEventBus::new());
        let s = session(NodeId::new());
        let id = s.id;

        map.add(s.clone()).unwrap();
        assert!(matches!(
            map.add(s),
            Err(SessionMapError::Duplicate(existing)) if existing == id
        ));
    }

    #[tokio::test]
    async fn test_session_closed_event_removes_entry() {
        let bus = LocalEventBus::new();
        let map = SessionMap::new(bus.clone());

        let node_id = NodeId::new();
        let s = session(node_id);
        let id = s.id;
        map.add(s).unwrap();

        bus.fire(GridEvent::SessionClosed {
            session_id: id,
            node_id,
        });

        // The listener runs on its own task; give it a beat.
        for _ in 0..50 {
            if map.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} was not removed after SessionClosed");
    }

    #[tokio::test]
    async fn test_owned_by_filters_by_node() {
        let map = SessionMap::new(LocalEventBus::new());
        let node_a = NodeId::new();
        let node_b = NodeId::new();

        map.add(session(node_a)).unwrap();
        map.add(session(node_a)).unwrap();
        map.add(session(node_b)).unwrap();

        assert_eq!(map.owned_by(node_a).len(), 2);
        assert_eq!(map.owned_by(node_b).len(), 1);
    }
}
