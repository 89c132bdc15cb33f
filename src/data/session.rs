//! Session descriptors

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::capabilities::Capabilities;
use super::status::NodeId;

/// Unique identifier of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A running automation session on one slot of one node
///
/// Created by a session factory, owned by exactly one node, destroyed by
/// `stop` on that node or by node removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Node this session runs on
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,

    /// The stereotype of the slot serving this session
    pub stereotype: Capabilities,

    /// Negotiated capabilities returned to the caller
    pub capabilities: Capabilities,

    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,

    /// Address the caller should drive the session at
    pub uri: String,
}

impl Session {
    pub fn duration(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}
