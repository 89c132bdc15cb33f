//! Node and distributor status snapshots
//!
//! These are the read-only views the scheduler ranks on and the status
//! endpoint serves. Everything here is wire-visible and serializes with
//! camelCase names.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::capabilities::Capabilities;
use super::slot::{SlotState, SlotStatus};

/// Unique identifier of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Admissible-for-scheduling flag of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Availability {
    Up,
    Down,
    Draining,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Up => write!(f, "UP"),
            Availability::Down => write!(f, "DOWN"),
            Availability::Draining => write!(f, "DRAINING"),
        }
    }
}

/// Snapshot of one node's slots and availability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,

    /// Externally reachable address of the node
    pub uri: String,

    pub availability: Availability,

    /// Monotonic: once set it never resets
    pub draining: bool,

    /// Upper bound on concurrently occupied slots
    #[serde(rename = "maxSessionCount")]
    pub max_session_count: usize,

    pub slots: Vec<SlotStatus>,
}

impl NodeStatus {
    /// Slots currently serving or starting a session
    pub fn active_slot_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count()
    }

    pub fn free_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }

    /// Advertised capacity: free slots when up and not draining, else zero.
    /// The max-session cap bounds it.
    pub fn capacity(&self) -> usize {
        if self.availability != Availability::Up || self.draining {
            return 0;
        }
        let headroom = self
            .max_session_count
            .saturating_sub(self.active_slot_count());
        self.free_slot_count().min(headroom)
    }

    pub fn has_capacity(&self) -> bool {
        self.capacity() > 0
    }

    /// Free slots whose stereotype satisfies `requested`
    pub fn matching_free_slots(&self, requested: &Capabilities) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_free() && s.stereotype.matches(requested))
            .count()
    }

    /// Does any slot, regardless of state, advertise a stereotype that
    /// satisfies `requested`?
    pub fn supports(&self, requested: &Capabilities) -> bool {
        self.slots.iter().any(|s| s.stereotype.matches(requested))
    }

    /// Number of distinct stereotypes this node advertises
    pub fn stereotype_count(&self) -> usize {
        let mut seen: Vec<&Capabilities> = Vec::new();
        for slot in &self.slots {
            if !seen.contains(&&slot.stereotype) {
                seen.push(&slot.stereotype);
            }
        }
        seen.len()
    }

    /// Earliest last-started instant across the node's slots; a never-used
    /// slot counts as the epoch.
    pub fn least_recently_started(&self) -> DateTime<Utc> {
        self.slots
            .iter()
            .map(|s| s.last_started.unwrap_or(DateTime::UNIX_EPOCH))
            .min()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// Aggregated snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorStatus {
    pub nodes: Vec<NodeStatus>,

    #[serde(rename = "hasCapacity")]
    pub has_capacity: bool,
}
