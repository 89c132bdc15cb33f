//! New-session request queue
//!
//! An ordered FIFO of pending session requests. Tail insertion announces
//! the request on the bus; head insertion is reserved for retries and
//! schedules a delayed re-announcement. The queue never hands out a
//! request past its deadline: expiry is checked on removal and on every
//! retry fire, and an expired request is rejected on the bus instead.
//!
//! All mutations go through one write-preferring readers-writer lock.
//! Critical sections do no I/O; events fire after the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::data::{RequestId, SessionRequest};
use crate::events::{EventBus, GridEvent, RejectionReason};

pub struct SessionRequestQueue {
    bus: Arc<dyn EventBus>,
    requests: RwLock<VecDeque<SessionRequest>>,
    retry_interval: Duration,
    closed: AtomicBool,
}

impl SessionRequestQueue {
    pub fn new(bus: Arc<dyn EventBus>, retry_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            requests: RwLock::new(VecDeque::new()),
            retry_interval,
            closed: AtomicBool::new(false),
        })
    }

    /// Append a request and announce it on the bus.
    ///
    /// Returns false only when the queue is shutting down.
    pub fn offer_last(&self, request: SessionRequest) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let request_id = request.id;
        {
            let mut requests = self.requests.write();
            requests.push_back(request);
        }
        self.bus.fire(GridEvent::NewSessionRequest(request_id));
        true
    }

    /// Insert a request at the head and schedule a delayed retry fire.
    ///
    /// Head insertion puts the request ahead of every tail-inserted
    /// request present at insertion time. The retry fire is clamped so it
    /// never lands past the request's deadline; if the deadline has
    /// already passed when the fire runs, the request is rejected instead.
    pub fn offer_first(self: &Arc<Self>, request: SessionRequest) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let request_id = request.id;
        let deadline = request.deadline;
        {
            let mut requests = self.requests.write();
            requests.push_front(request);
        }

        let delay = self
            .retry_interval
            .min(deadline.saturating_duration_since(std::time::Instant::now()));
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.retry_fire(request_id);
        });
        true
    }

    fn retry_fire(&self, request_id: RequestId) {
        let expired = {
            let requests = self.requests.read();
            match requests.iter().find(|r| r.id == request_id) {
                Some(request) => request.is_expired(),
                // Already placed or rejected by someone else.
                None => return,
            }
        };

        if expired {
            info!(%request_id, "new session request timed out");
            let removed = {
                let mut requests = self.requests.write();
                let before = requests.len();
                requests.retain(|r| r.id != request_id);
                before != requests.len()
            };
            if removed {
                self.bus.fire(GridEvent::NewSessionRejected {
                    request_id,
                    reason: RejectionReason::Timeout,
                });
            }
        } else {
            debug!(%request_id, "re-announcing queued request, all slots were busy");
            self.bus.fire(GridEvent::NewSessionRequest(request_id));
        }
    }

    /// Clone of the head request, if any.
    pub fn peek(&self) -> Option<SessionRequest> {
        self.requests.read().front().cloned()
    }

    /// Remove a request by id.
    ///
    /// The head is the O(1) fast path; anything else is a linear scan. An
    /// expired request is rejected on the bus and `None` is returned, so a
    /// caller never receives a request it is not allowed to serve.
    pub fn remove(&self, request_id: RequestId) -> Option<SessionRequest> {
        let removed = {
            let mut requests = self.requests.write();
            match requests.front() {
                Some(head) if head.id == request_id => requests.pop_front(),
                _ => requests
                    .iter()
                    .position(|r| r.id == request_id)
                    .and_then(|index| requests.remove(index)),
            }
        };

        match removed {
            Some(request) if request.is_expired() => {
                self.bus.fire(GridEvent::NewSessionRejected {
                    request_id,
                    reason: RejectionReason::Timeout,
                });
                None
            }
            other => other,
        }
    }

    /// Drain every pending request, rejecting each as cancelled.
    ///
    /// Returns the number of cancelled requests.
    pub fn clear(&self) -> usize {
        let drained: Vec<SessionRequest> = {
            let mut requests = self.requests.write();
            requests.drain(..).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "clearing new session request queue");
        }
        for request in &drained {
            self.bus.fire(GridEvent::NewSessionRejected {
                request_id: request.id,
                reason: RejectionReason::Cancelled,
            });
        }
        drained.len()
    }

    /// Stop accepting offers and cancel everything still queued.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.clear()
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }
}
