//! Shared application state

use std::sync::Arc;

use crate::config::GridConfig;
use crate::distributor::Distributor;
use crate::events::{EventBus, LocalEventBus};
use crate::queue::SessionRequestQueue;
use crate::sessionmap::SessionMap;

/// Everything the HTTP handlers need, wired together
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn EventBus>,
    pub sessions: Arc<SessionMap>,
    pub queue: Arc<SessionRequestQueue>,
    pub distributor: Arc<Distributor>,
}

impl AppState {
    /// Build the full grid core from one configuration
    pub fn new(config: GridConfig) -> Self {
        let bus = LocalEventBus::new();
        let sessions = SessionMap::new(bus.clone());
        let queue = SessionRequestQueue::new(bus.clone(), config.retry_interval);
        let distributor = Distributor::new(
            bus.clone(),
            Arc::clone(&sessions),
            Arc::clone(&queue),
            config,
        );

        Self {
            bus,
            sessions,
            queue,
            distributor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_wires_an_empty_grid() {
        let state = AppState::new(GridConfig::default());

        assert!(state.distributor.status().nodes.is_empty());
        assert!(!state.distributor.status().has_capacity);
        assert!(state.queue.is_empty());
        assert!(state.sessions.is_empty());
    }
}
