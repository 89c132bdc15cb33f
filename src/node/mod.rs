//! Nodes
//!
//! A node owns a set of typed slots and the session backends behind them.
//! It places sessions on free matching slots, reports status snapshots,
//! runs a pluggable health check and drains monotonically: once draining,
//! it accepts nothing new and removes itself when the last slot empties.

pub mod factory;
pub mod health;
pub mod remote;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Secret;
use crate::data::{
    Availability, Capabilities, NodeId, NodeStatus, Session, SessionId, SlotId, SlotState,
    SlotStatus,
};
use crate::events::{EventBus, GridEvent};

pub use factory::{
    CreateSessionRequest, CreatedSession, DriverSessionFactory, FailingSessionFactory,
    SessionFactory, SessionFactoryError, SessionTerminator, TestSessionFactory,
};
pub use health::{AlwaysUp, HealthCheck, HealthReport, HttpHealthCheck, SettableHealthCheck};

/// Why a node could not place a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no slot matches the requested capabilities")]
    NoMatch,

    #[error("all matching slots are busy")]
    NoCapacity,

    #[error("node is draining")]
    Draining,

    #[error("session factory failed: {0}")]
    FactoryFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
}

/// Contract between the distributor and a node, local or remote
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;

    /// Externally reachable address
    fn uri(&self) -> String;

    /// Secret presented at registration
    fn registration_secret(&self) -> Secret;

    /// Place a session on a free matching slot
    async fn new_session(&self, requested: &Capabilities) -> Result<Session, PlacementError>;

    /// Terminate a session and free its slot. Idempotent: an unknown id is
    /// a no-op answered with `SessionNotFound`.
    async fn stop(&self, session_id: SessionId) -> Result<(), NodeError>;

    /// Stop accepting new sessions. Monotonic; the node removes itself
    /// once its last occupied slot is released.
    fn drain(&self);

    fn is_draining(&self) -> bool;

    /// Snapshot of the node's slots and self-reported availability. The
    /// distributor overlays its own reconciled availability on top.
    fn status(&self) -> NodeStatus;

    async fn health_check(&self) -> HealthReport;
}

pub type NodeRef = Arc<dyn Node>;

/// One slot and its bookkeeping
struct Slot {
    id: SlotId,
    stereotype: Capabilities,
    factory: Arc<dyn SessionFactory>,
    state: SlotState,
    session: Option<Session>,
    terminator: Option<SessionTerminator>,
    last_started: Option<DateTime<Utc>>,
}

impl Slot {
    fn status(&self) -> SlotStatus {
        SlotStatus {
            id: self.id,
            stereotype: self.stereotype.clone(),
            state: self.state,
            session_id: self.session.as_ref().map(|s| s.id),
            last_started: self.last_started,
        }
    }
}

/// In-process node owning its slots and session backends
pub struct LocalNode {
    id: NodeId,
    uri: String,
    secret: Secret,
    bus: Arc<dyn EventBus>,
    max_session_count: usize,
    health: Arc<dyn HealthCheck>,
    draining: AtomicBool,
    removed: AtomicBool,
    slots: Mutex<Vec<Slot>>,
}

impl LocalNode {
    pub fn builder(
        bus: Arc<dyn EventBus>,
        uri: impl Into<String>,
        secret: Secret,
    ) -> LocalNodeBuilder {
        LocalNodeBuilder {
            bus,
            uri: uri.into(),
            secret,
            max_session_count: None,
            health: None,
            slots: Vec::new(),
        }
    }

    /// Fire `NodeRemoved` once a draining node has no occupied slots left.
    fn remove_if_drained_and_empty(&self) {
        if !self.is_draining() {
            return;
        }
        let empty = self
            .slots
            .lock()
            .iter()
            .all(|slot| slot.state == SlotState::Free);
        if empty && !self.removed.swap(true, Ordering::SeqCst) {
            info!(node_id = %self.id, "drained node is empty, removing");
            self.bus.fire(GridEvent::NodeRemoved(self.id));
        }
    }

    fn release_slot(&self, slot_id: SlotId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.id == slot_id) {
            slot.state = SlotState::Free;
            slot.session = None;
            slot.terminator = None;
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn registration_secret(&self) -> Secret {
        self.secret.clone()
    }

    async fn new_session(&self, requested: &Capabilities) -> Result<Session, PlacementError> {
        if self.is_draining() {
            return Err(PlacementError::Draining);
        }

        // Reserve a slot under the lock, then start the backend outside it.
        let (slot_id, stereotype, factory) = {
            let mut slots = self.slots.lock();

            let occupied = slots
                .iter()
                .filter(|s| s.state != SlotState::Free)
                .count();

            let mut any_match = false;
            let mut best: Option<usize> = None;
            for (index, slot) in slots.iter().enumerate() {
                if !slot.stereotype.matches(requested) {
                    continue;
                }
                any_match = true;
                if slot.state != SlotState::Free {
                    continue;
                }
                // Least-recently-used wins, never-used counts as oldest.
                let candidate_started =
                    slot.last_started.unwrap_or(DateTime::UNIX_EPOCH);
                let replace = match best {
                    None => true,
                    Some(current) => {
                        candidate_started
                            < slots[current].last_started.unwrap_or(DateTime::UNIX_EPOCH)
                    }
                };
                if replace {
                    best = Some(index);
                }
            }

            if !any_match {
                return Err(PlacementError::NoMatch);
            }
            let Some(index) = best else {
                return Err(PlacementError::NoCapacity);
            };
            if occupied >= self.max_session_count {
                return Err(PlacementError::NoCapacity);
            }

            let slot = &mut slots[index];
            slot.state = SlotState::Reserved;
            (slot.id, slot.stereotype.clone(), Arc::clone(&slot.factory))
        };

        let request = CreateSessionRequest {
            node_id: self.id,
            node_uri: self.uri.clone(),
            stereotype,
            requested: requested.clone(),
        };

        match factory.create(request).await {
            Ok(created) => {
                let session = created.session;
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.iter_mut().find(|s| s.id == slot_id) {
                    slot.state = SlotState::Active;
                    slot.session = Some(session.clone());
                    slot.terminator = Some(created.terminator);
                    slot.last_started = Some(session.started_at);
                }
                debug!(node_id = %self.id, session_id = %session.id, "session started");
                Ok(session)
            }
            Err(e) => {
                warn!(node_id = %self.id, error = %e, "session factory failed, releasing slot");
                self.release_slot(slot_id);
                self.remove_if_drained_and_empty();
                Err(PlacementError::FactoryFailed(e.to_string()))
            }
        }
    }

    async fn stop(&self, session_id: SessionId) -> Result<(), NodeError> {
        let terminator = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots
                .iter_mut()
                .find(|s| s.session.as_ref().map(|session| session.id) == Some(session_id))
            else {
                return Err(NodeError::SessionNotFound(session_id));
            };
            slot.state = SlotState::Free;
            slot.session = None;
            slot.terminator.take()
        };

        // Backend teardown does I/O; run it after the lock is gone.
        if let Some(mut terminator) = terminator {
            terminator.terminate();
        }

        debug!(node_id = %self.id, %session_id, "session stopped");
        self.bus.fire(GridEvent::SessionClosed {
            session_id,
            node_id: self.id,
        });
        self.remove_if_drained_and_empty();
        Ok(())
    }

    fn drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!(node_id = %self.id, "node drain started");
            self.bus.fire(GridEvent::NodeDrainStarted(self.id));
            self.remove_if_drained_and_empty();
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn status(&self) -> NodeStatus {
        let draining = self.is_draining();
        NodeStatus {
            node_id: self.id,
            uri: self.uri.clone(),
            availability: if draining {
                Availability::Draining
            } else {
                Availability::Up
            },
            draining,
            max_session_count: self.max_session_count,
            slots: self.slots.lock().iter().map(Slot::status).collect(),
        }
    }

    async fn health_check(&self) -> HealthReport {
        self.health.check().await
    }
}

/// Builder for [`LocalNode`]
pub struct LocalNodeBuilder {
    bus: Arc<dyn EventBus>,
    uri: String,
    secret: Secret,
    max_session_count: Option<usize>,
    health: Option<Arc<dyn HealthCheck>>,
    slots: Vec<(Capabilities, Arc<dyn SessionFactory>)>,
}

impl LocalNodeBuilder {
    /// Register a slot able to run sessions matching `stereotype`
    pub fn add_slot(mut self, stereotype: Capabilities, factory: Arc<dyn SessionFactory>) -> Self {
        if !factory.accepts(&stereotype) {
            warn!(%stereotype, "factory does not accept the stereotype it is registered for");
        }
        self.slots.push((stereotype, factory));
        self
    }

    /// Cap concurrently occupied slots below the slot count
    pub fn with_max_session_count(mut self, max: usize) -> Self {
        self.max_session_count = Some(max);
        self
    }

    pub fn with_health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Arc<LocalNode> {
        let slot_count = self.slots.len();
        let slots = self
            .slots
            .into_iter()
            .map(|(stereotype, factory)| Slot {
                id: SlotId::new(),
                stereotype,
                factory,
                state: SlotState::Free,
                session: None,
                terminator: None,
                last_started: None,
            })
            .collect();

        Arc::new(LocalNode {
            id: NodeId::new(),
            uri: self.uri,
            secret: self.secret,
            bus: self.bus,
            max_session_count: self.max_session_count.unwrap_or(slot_count),
            health: self.health.unwrap_or_else(|| Arc::new(AlwaysUp)),
            draining: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            slots: Mutex::new(slots),
        })
    }
}
