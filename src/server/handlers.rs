//! HTTP handlers for the distributor wire surface
//!
//! Error kinds map onto status codes at this edge: 408 for a timed-out
//! request, 400 for unsupported capabilities or a malformed payload, 401
//! for a refused registration, 404 for unknown ids, 500 for factory
//! failures.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::data::{NewSessionPayload, NodeId, SessionId};
use crate::distributor::{DistributorError, NewSessionError};
use crate::node::remote::{NodeRegistration, RemoteNode};

use super::state::AppState;

/// The W3C-style error envelope
fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "value": {
                "error": kind,
                "message": message,
                "stacktrace": "",
            }
        })),
    )
        .into_response()
}

fn status_for(error: &NewSessionError) -> StatusCode {
    match error {
        NewSessionError::Timeout => StatusCode::REQUEST_TIMEOUT,
        NewSessionError::UnsupportedCapabilities | NewSessionError::InvalidArgument(_) => {
            StatusCode::BAD_REQUEST
        }
        NewSessionError::FactoryFailed(_) | NewSessionError::Cancelled => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// POST /se/grid/distributor/session
pub async fn create_session(State(state): State<AppState>, body: String) -> Response {
    let payload: NewSessionPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid argument",
                &format!("malformed new session payload: {e}"),
            );
        }
    };

    match state.distributor.new_session(&payload).await {
        Ok(response) => (StatusCode::OK, Json(response.to_wire())).into_response(),
        Err(e) => error_response(status_for(&e), e.wire_kind(), &e.to_string()),
    }
}

/// POST /se/grid/distributor/node
pub async fn register_node(State(state): State<AppState>, body: String) -> Response {
    let registration: NodeRegistration = match serde_json::from_str(&body) {
        Ok(registration) => registration,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid argument",
                &format!("malformed node registration: {e}"),
            );
        }
    };

    let node_id = registration.status.node_id;
    let node = RemoteNode::new(state.bus.clone(), registration);
    match state.distributor.add(node) {
        Ok(()) => {
            debug!(%node_id, "node registered over http");
            (StatusCode::OK, Json(json!({"value": null}))).into_response()
        }
        Err(DistributorError::NodeRejected(_)) => error_response(
            StatusCode::UNAUTHORIZED,
            "node rejected",
            "registration secret mismatch",
        ),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "node rejected", &e.to_string()),
    }
}

/// DELETE /se/grid/distributor/node/{node_id}
pub async fn remove_node(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    let node_id: NodeId = match node_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid argument",
                "node id is not a valid uuid",
            );
        }
    };

    match state.distributor.remove(node_id) {
        Ok(()) => (StatusCode::OK, Json(json!({"value": null}))).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, "not found", &e.to_string()),
    }
}

/// POST /se/grid/distributor/node/{node_id}/drain
pub async fn drain_node(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    let node_id: NodeId = match node_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid argument",
                "node id is not a valid uuid",
            );
        }
    };

    match state.distributor.drain(node_id) {
        Ok(()) => (StatusCode::OK, Json(json!({"value": null}))).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, "not found", &e.to_string()),
    }
}

/// GET /se/grid/distributor/status
pub async fn status(State(state): State<AppState>) -> Response {
    Json(state.distributor.status()).into_response()
}

/// GET /se/grid/distributor/session/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id: SessionId = match session_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid argument",
                "session id is not a valid uuid",
            );
        }
    };

    match state.sessions.get(session_id) {
        Ok(session) => {
            let duration_ms = session.duration().num_milliseconds();
            (
                StatusCode::OK,
                Json(json!({
                    "value": {
                        "session": session,
                        "sessionDurationMillis": duration_ms,
                    }
                })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::NOT_FOUND, "not found", &e.to_string()),
    }
}

/// DELETE /se/grid/distributor/queue
pub async fn clear_queue(State(state): State<AppState>) -> Response {
    let cancelled = state.queue.clear();
    (StatusCode::OK, Json(json!({"value": cancelled}))).into_response()
}
