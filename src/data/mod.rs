//! Core data model of the grid
//!
//! Everything the distributor, queue, session map and nodes exchange:
//! capability sets, slots, sessions, pending requests and status
//! snapshots. Wire-visible types serialize with camelCase names.

pub mod capabilities;
pub mod request;
pub mod session;
pub mod slot;
pub mod status;

pub use capabilities::{CapabilityError, Capabilities, NewSessionPayload};
pub use request::{CreateSessionResponse, RequestId, SessionRequest};
pub use session::{Session, SessionId};
pub use slot::{SlotId, SlotState, SlotStatus};
pub use status::{Availability, DistributorStatus, NodeId, NodeStatus};
