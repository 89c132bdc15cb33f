//! Distributor
//!
//! The scheduler. Owns the registration set, consumes the new-session
//! queue, ranks candidate nodes and forwards requests to their session
//! factories. Registration is guarded by a shared-secret handshake; node
//! health is reconciled on a fixed cadence; callers of `new_session` block
//! on a waiter the scheduling loop resolves, bounded by the request
//! deadline.

pub mod ranking;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast::error::RecvError, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{GridConfig, Secret};
use crate::data::{
    Availability, Capabilities, CreateSessionResponse, DistributorStatus, NewSessionPayload,
    NodeId, NodeStatus, RequestId, SessionRequest,
};
use crate::events::{EventBus, GridEvent, RejectionReason};
use crate::node::{NodeRef, PlacementError};
use crate::queue::SessionRequestQueue;
use crate::sessionmap::SessionMap;

use ranking::Candidate;

/// Errors answered to registration-surface calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributorError {
    #[error("node {0} rejected: registration secret mismatch")]
    NodeRejected(NodeId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),
}

/// Why a new-session call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NewSessionError {
    #[error("no registered node supports the requested capabilities")]
    UnsupportedCapabilities,

    #[error("new session request timed out")]
    Timeout,

    #[error("new session request was cancelled")]
    Cancelled,

    #[error("session factory failed: {0}")]
    FactoryFailed(String),

    #[error("invalid new session payload: {0}")]
    InvalidArgument(String),
}

impl NewSessionError {
    /// Error kind in the wire envelope
    pub fn wire_kind(&self) -> &'static str {
        match self {
            NewSessionError::Timeout => "timeout",
            NewSessionError::InvalidArgument(_) => "invalid argument",
            _ => "session not created",
        }
    }
}

struct NodeEntry {
    node: NodeRef,
    /// Reconciled availability; overrides the node's self-view
    availability: Availability,
}

type Waiter = oneshot::Sender<Result<CreateSessionResponse, NewSessionError>>;

pub struct Distributor {
    bus: Arc<dyn EventBus>,
    sessions: Arc<SessionMap>,
    queue: Arc<SessionRequestQueue>,
    secret: Secret,
    request_timeout: std::time::Duration,
    nodes: RwLock<Vec<NodeEntry>>,
    waiters: DashMap<RequestId, Waiter>,
    shutdown: watch::Sender<bool>,
}

impl Distributor {
    /// Build the distributor and spawn its scheduling and health loops.
    pub fn new(
        bus: Arc<dyn EventBus>,
        sessions: Arc<SessionMap>,
        queue: Arc<SessionRequestQueue>,
        config: GridConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let distributor = Arc::new(Self {
            bus: Arc::clone(&bus),
            sessions,
            queue,
            secret: config.registration_secret.clone(),
            request_timeout: config.request_timeout,
            nodes: RwLock::new(Vec::new()),
            waiters: DashMap::new(),
            shutdown,
        });

        distributor.spawn_event_loop();
        distributor.spawn_health_loop(config.health_check_interval);
        distributor
    }

    /// Stop the background loops and cancel everything still queued.
    ///
    /// Waiting callers are answered with `Cancelled` before the loops
    /// stop, so nobody is left riding out a deadline.
    pub fn shutdown(&self) {
        self.queue.close();
        let waiting: Vec<RequestId> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for request_id in waiting {
            self.complete_waiter(request_id, Err(NewSessionError::Cancelled));
        }
        let _ = self.shutdown.send(true);
    }

    // =========================================================================
    // Registration surface
    // =========================================================================

    /// Register a node after verifying the shared secret.
    ///
    /// Idempotent on node id: the first registration wins, re-adding is a
    /// no-op. `NodeAdded` fires on the first add only; a secret mismatch
    /// fires `NodeRejected` and the node is never registered.
    pub fn add(&self, node: NodeRef) -> Result<(), DistributorError> {
        let node_id = node.id();
        if !self.secret.matches(&node.registration_secret()) {
            warn!(%node_id, "node registration rejected: secret mismatch");
            self.bus.fire(GridEvent::NodeRejected(node_id));
            return Err(DistributorError::NodeRejected(node_id));
        }

        {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|entry| entry.node.id() == node_id) {
                debug!(%node_id, "node already registered, keeping first registration");
                return Ok(());
            }
            nodes.push(NodeEntry {
                node,
                availability: Availability::Up,
            });
        }

        info!(%node_id, "node registered");
        self.bus.fire(GridEvent::NodeAdded(node_id));
        Ok(())
    }

    /// Unregister a node immediately, regardless of active sessions.
    ///
    /// Sessions the node was serving stay in the session map until they
    /// are closed explicitly.
    pub fn remove(&self, node_id: NodeId) -> Result<(), DistributorError> {
        if !self.unregister(node_id) {
            return Err(DistributorError::NodeNotFound(node_id));
        }
        let orphaned = self.sessions.owned_by(node_id).len();
        if orphaned > 0 {
            warn!(%node_id, orphaned, "node removed with sessions still in the session map");
        }
        self.bus.fire(GridEvent::NodeRemoved(node_id));
        Ok(())
    }

    fn unregister(&self, node_id: NodeId) -> bool {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|entry| entry.node.id() != node_id);
        if nodes.len() != before {
            info!(%node_id, "node unregistered");
            true
        } else {
            false
        }
    }

    /// Ask a node to drain: it keeps its sessions, accepts nothing new and
    /// removes itself once empty.
    pub fn drain(&self, node_id: NodeId) -> Result<(), DistributorError> {
        let node = {
            let mut nodes = self.nodes.write();
            let Some(entry) = nodes.iter_mut().find(|entry| entry.node.id() == node_id) else {
                return Err(DistributorError::NodeNotFound(node_id));
            };
            entry.availability = Availability::Draining;
            Arc::clone(&entry.node)
        };
        // Fires DrainStarted, and NodeRemoved right away if already empty.
        node.drain();
        Ok(())
    }

    // =========================================================================
    // Session surface
    // =========================================================================

    /// Create a session. Synchronous from the caller's viewpoint: the
    /// request is queued and the call waits for the scheduling loop, a
    /// rejection, or the deadline, whichever comes first.
    pub async fn new_session(
        &self,
        payload: &NewSessionPayload,
    ) -> Result<CreateSessionResponse, NewSessionError> {
        let alternatives = payload
            .alternatives()
            .map_err(|e| NewSessionError::InvalidArgument(e.to_string()))?;

        // A grid that has nodes, none of which advertises a matching
        // stereotype, can never serve this request: fail fast instead of
        // letting it ride out the deadline. An empty grid still waits, a
        // node may yet register.
        let statuses = self.node_statuses();
        if !statuses.is_empty() && !supports_any(&statuses, &alternatives) {
            return Err(NewSessionError::UnsupportedCapabilities);
        }

        let request = SessionRequest::new(alternatives, self.request_timeout);
        let request_id = request.id;
        let deadline = tokio::time::Instant::from_std(request.deadline);

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);
        if !self.queue.offer_last(request) {
            self.waiters.remove(&request_id);
            return Err(NewSessionError::Cancelled);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NewSessionError::Cancelled),
            Err(_) => {
                self.waiters.remove(&request_id);
                // Fires the timeout rejection if the request is still queued.
                let _ = self.queue.remove(request_id);
                Err(NewSessionError::Timeout)
            }
        }
    }

    /// Force an immediate reconciliation pass: recheck every node's health,
    /// then attempt to place whatever is queued.
    pub async fn refresh(&self) {
        self.reconcile_health().await;
        self.schedule_pass().await;
    }

    // =========================================================================
    // Status surface
    // =========================================================================

    /// Aggregated snapshot, with reconciled availability overlaid on each
    /// node's self-reported status.
    pub fn status(&self) -> DistributorStatus {
        let nodes: Vec<NodeStatus> = self
            .node_refs()
            .into_iter()
            .map(|(node, availability, _)| overlay(node.status(), availability))
            .collect();
        let has_capacity = nodes.iter().any(NodeStatus::has_capacity);
        DistributorStatus {
            nodes,
            has_capacity,
        }
    }

    /// Nodes currently admissible for scheduling
    pub fn available_nodes(&self) -> Vec<NodeId> {
        self.node_refs()
            .into_iter()
            .filter(|(node, availability, _)| {
                *availability == Availability::Up && !node.is_draining()
            })
            .map(|(node, _, _)| node.id())
            .collect()
    }

    pub fn session_map(&self) -> &Arc<SessionMap> {
        &self.sessions
    }

    // =========================================================================
    // Scheduling loop
    // =========================================================================

    fn spawn_event_loop(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let Some(distributor) = weak.upgrade() else { break };
                            distributor.handle_event(event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "distributor lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    fn spawn_health_loop(self: &Arc<Self>, interval: std::time::Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(distributor) = weak.upgrade() else { break };
                        distributor.reconcile_health().await;
                    }
                }
            }
        });
    }

    async fn handle_event(&self, event: GridEvent) {
        match event {
            GridEvent::NewSessionRequest(_)
            | GridEvent::NodeAdded(_)
            | GridEvent::NodeStatus(_) => self.schedule_pass().await,
            GridEvent::NodeRemoved(node_id) => {
                // Fired by drained nodes removing themselves; our own
                // removals already dropped the entry.
                self.unregister(node_id);
            }
            GridEvent::NewSessionRejected { request_id, reason } => {
                self.complete_waiter(
                    request_id,
                    Err(match reason {
                        RejectionReason::Timeout => NewSessionError::Timeout,
                        RejectionReason::Cancelled => NewSessionError::Cancelled,
                        RejectionReason::Unsupported => NewSessionError::UnsupportedCapabilities,
                    }),
                );
            }
            _ => {}
        }
    }

    /// One scheduling pass: place queued requests until nothing fits.
    async fn schedule_pass(&self) {
        loop {
            let Some(head) = self.queue.peek() else { return };
            if head.is_expired() {
                // Rejects on the bus; the waiter completes via the event.
                let _ = self.queue.remove(head.id);
                continue;
            }

            let statuses = self.node_statuses();
            if statuses.is_empty() {
                return;
            }

            let chosen = choose_node(&statuses, &head.alternatives);
            let Some((node, requested)) = chosen else {
                if !supports_any(&statuses, &head.alternatives) {
                    // Nothing in the fleet will ever serve this request.
                    if self.queue.remove(head.id).is_some() {
                        debug!(request_id = %head.id, "no registered stereotype matches, rejecting");
                        self.complete_waiter(
                            head.id,
                            Err(NewSessionError::UnsupportedCapabilities),
                        );
                        self.bus.fire(GridEvent::NewSessionRejected {
                            request_id: head.id,
                            reason: RejectionReason::Unsupported,
                        });
                    }
                    continue;
                }
                // Capacity will free up; a later event retries.
                return;
            };

            // Claim the request; a racing pass may have beaten us to it.
            let Some(request) = self.queue.remove(head.id) else {
                continue;
            };

            match node.new_session(&requested).await {
                Ok(session) => {
                    if let Err(e) = self.sessions.add(session.clone()) {
                        warn!(session_id = %session.id, error = %e, "failed to record session");
                    }
                    debug!(
                        request_id = %request.id,
                        session_id = %session.id,
                        node_id = %session.node_id,
                        "session placed"
                    );
                    self.complete_waiter(request.id, Ok(CreateSessionResponse { session }));
                }
                Err(PlacementError::FactoryFailed(message)) => {
                    self.retry_or_reject(request, Some(message));
                    return;
                }
                Err(reason) => {
                    // Lost a race with another placement, a drain or a
                    // health transition; try again shortly.
                    debug!(request_id = %request.id, %reason, "placement raced, retrying");
                    self.retry_or_reject(request, None);
                    return;
                }
            }
        }
    }

    /// Put a failed request back at the head of the queue, or reject it if
    /// its deadline has passed.
    fn retry_or_reject(&self, request: SessionRequest, failure: Option<String>) {
        if request.is_expired() {
            let request_id = request.id;
            let error = match failure {
                Some(message) => NewSessionError::FactoryFailed(message),
                None => NewSessionError::Timeout,
            };
            self.complete_waiter(request_id, Err(error));
            self.bus.fire(GridEvent::NewSessionRejected {
                request_id,
                reason: RejectionReason::Timeout,
            });
        } else {
            self.queue.offer_first(request);
        }
    }

    fn complete_waiter(
        &self,
        request_id: RequestId,
        result: Result<CreateSessionResponse, NewSessionError>,
    ) {
        if let Some((_, waiter)) = self.waiters.remove(&request_id) {
            // The caller may have stopped waiting already.
            let _ = waiter.send(result);
        }
    }

    // =========================================================================
    // Health reconciliation
    // =========================================================================

    /// Poll every node's health check and update its availability. Probes
    /// run concurrently and never hold the registration lock across a
    /// check call. A node coming back up triggers an immediate scheduling
    /// attempt.
    async fn reconcile_health(&self) {
        let snapshot = self.node_refs();
        if snapshot.is_empty() {
            return;
        }

        let probes = snapshot.into_iter().map(|(node, _, _)| async move {
            let report = node.health_check().await;
            (node, report)
        });
        let results = futures::future::join_all(probes).await;

        let mut recovered = false;
        for (node, report) in results {
            let node_id = node.id();
            {
                let mut nodes = self.nodes.write();
                let Some(entry) = nodes.iter_mut().find(|entry| entry.node.id() == node_id)
                else {
                    continue;
                };
                if entry.availability == Availability::Draining || node.is_draining() {
                    entry.availability = Availability::Draining;
                    continue;
                }
                if entry.availability != report.availability {
                    info!(
                        %node_id,
                        from = %entry.availability,
                        to = %report.availability,
                        reason = %report.message,
                        "node availability changed"
                    );
                    if report.availability == Availability::Up {
                        recovered = true;
                    }
                    entry.availability = report.availability;
                }
            }

            self.bus.fire(GridEvent::NodeStatus(node.status()));
        }

        if recovered {
            self.schedule_pass().await;
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    fn node_refs(&self) -> Vec<(NodeRef, Availability, usize)> {
        self.nodes
            .read()
            .iter()
            .enumerate()
            .map(|(index, entry)| (Arc::clone(&entry.node), entry.availability, index))
            .collect()
    }

    /// Status snapshot of every registered node with reconciled
    /// availability overlaid. Taken without holding the registration lock
    /// across node calls.
    fn node_statuses(&self) -> Vec<(NodeRef, usize, NodeStatus)> {
        self.node_refs()
            .into_iter()
            .map(|(node, availability, index)| {
                let status = overlay(node.status(), availability);
                (node, index, status)
            })
            .collect()
    }
}

fn overlay(mut status: NodeStatus, availability: Availability) -> NodeStatus {
    status.availability = if status.draining {
        Availability::Draining
    } else {
        availability
    };
    status
}

fn supports_any(statuses: &[(NodeRef, usize, NodeStatus)], alternatives: &[Capabilities]) -> bool {
    statuses
        .iter()
        .any(|(_, _, status)| alternatives.iter().any(|alt| status.supports(alt)))
}

/// Pick the best node for the first alternative that has any candidate.
fn choose_node(
    statuses: &[(NodeRef, usize, NodeStatus)],
    alternatives: &[Capabilities],
) -> Option<(NodeRef, Capabilities)> {
    for requested in alternatives {
        let candidates: Vec<Candidate> = statuses
            .iter()
            .filter(|(_, _, status)| {
                status.availability == Availability::Up
                    && !status.draining
                    && status.capacity() > 0
                    && status.matching_free_slots(requested) > 0
            })
            .map(|(_, index, status)| Candidate {
                node_id: status.node_id,
                insertion_order: *index,
                status: status.clone(),
            })
            .collect();

        if candidates.is_empty() {
            continue;
        }

        let best = ranking::rank(candidates, requested).remove(0);
        let node = statuses
            .iter()
            .find(|(node, _, _)| node.id() == best.node_id)
            .map(|(node, _, _)| Arc::clone(node))?;
        return Some((node, requested.clone()));
    }
    None
}
