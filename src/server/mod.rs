//! HTTP surface of the distributor

pub mod handlers;
pub mod state;

use axum::routing::{delete, get, post};
use axum::Router;

pub use state::AppState;

/// The distributor's wire surface
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/se/grid/distributor/session",
            post(handlers::create_session),
        )
        .route(
            "/se/grid/distributor/session/{session_id}",
            get(handlers::get_session),
        )
        .route("/se/grid/distributor/node", post(handlers::register_node))
        .route(
            "/se/grid/distributor/node/{node_id}",
            delete(handlers::remove_node),
        )
        .route(
            "/se/grid/distributor/node/{node_id}/drain",
            post(handlers::drain_node),
        )
        .route("/se/grid/distributor/status", get(handlers::status))
        .route("/se/grid/distributor/queue", delete(handlers::clear_queue))
        .with_state(state)
}
