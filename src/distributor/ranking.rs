//! Node ranking
//!
//! Given the candidate nodes for a request, produce a total order. Keys,
//! in sequence:
//!
//! 1. Load ratio (occupied slots over total slots), ascending: the
//!    least-loaded node wins.
//! 2. Stereotype specialization: free slots matching the requested
//!    stereotype minus the number of distinct stereotypes the node
//!    advertises, descending. Among equally loaded nodes this routes
//!    common browsers away from versatile nodes, so a fleet with one
//!    many-browser machine keeps its rare slots for the browsers only it
//!    can serve.
//! 3. Least-recently-used: the node whose slots started a session longest
//!    ago wins, spreading heat across the fleet.
//! 4. Stable registration order.

use std::cmp::Ordering;

use crate::data::{Capabilities, NodeId, NodeStatus};

/// One node under consideration for a request
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_id: NodeId,

    /// Position in the registration set, for the final tie-break
    pub insertion_order: usize,

    pub status: NodeStatus,
}

/// Order candidates best-first for `requested`
pub fn rank(mut candidates: Vec<Candidate>, requested: &Capabilities) -> Vec<Candidate> {
    candidates.sort_by(|a, b| compare(a, b, requested));
    candidates
}

fn compare(a: &Candidate, b: &Candidate, requested: &Capabilities) -> Ordering {
    load_ratio_order(&a.status, &b.status)
        .then_with(|| {
            specialization_score(&b.status, requested)
                .cmp(&specialization_score(&a.status, requested))
        })
        .then_with(|| {
            a.status
                .least_recently_started()
                .cmp(&b.status.least_recently_started())
        })
        .then_with(|| a.insertion_order.cmp(&b.insertion_order))
}

/// Compare occupied/total ratios exactly, by cross-multiplication
fn load_ratio_order(a: &NodeStatus, b: &NodeStatus) -> Ordering {
    let a_total = a.slots.len().max(1);
    let b_total = b.slots.len().max(1);
    (a.active_slot_count() * b_total).cmp(&(b.active_slot_count() * a_total))
}

fn specialization_score(status: &NodeStatus, requested: &Capabilities) -> i64 {
    status.matching_free_slots(requested) as i64 - status.stereotype_count() as i64
}
