//! Slot descriptors
//!
//! A slot is a single unit of concurrency on a node, bound to one
//! stereotype. Exactly one session is associated with a slot iff its state
//! is not `Free`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::capabilities::Capabilities;
use super::session::SessionId;

/// Unique identifier of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Occupancy state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotState {
    /// No session associated; the slot counts toward advertised capacity
    Free,
    /// Claimed for a session that the factory is still starting
    Reserved,
    /// Running a session
    Active,
}

/// Wire-visible snapshot of a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    pub id: SlotId,

    pub stereotype: Capabilities,

    pub state: SlotState,

    /// Session currently bound to this slot, absent when `Free`
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Most recent session start on this slot; absent if never used
    #[serde(rename = "lastStarted", skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
}

impl SlotStatus {
    pub fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }
}
