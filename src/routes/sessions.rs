//! Session lifecycle endpoints, driven by a pre-signed authorization.
//!
//! - `GET /api/v1/ssh/session/new?nodeId=<id>`: create or reuse a session
//! - `GET /api/v1/ssh/session/{id}/start`: issue the start-tunnel command
//! - `GET /api/v1/ssh/session/{id}/stop`: issue the stop-tunnel command and end the session
//!
//! None of these wait for the device; polling belongs to password login on
//! the operator SSH endpoint.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::PresignedAuth;
use crate::backend::NodeId;
use crate::error::TunnelError;
use crate::sessions::Session;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NewSessionQuery {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
}

fn envelope(session: &Session) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": session,
    }))
}

/// `GET /api/v1/ssh/session/new?nodeId=<id>`
pub async fn new_session(
    State(state): State<AppState>,
    PresignedAuth(auth): PresignedAuth,
    Query(query): Query<NewSessionQuery>,
) -> Result<Json<Value>, TunnelError> {
    let session = state.activator.create(query.node_id, &auth).await?;
    info!(session_id = %session.id, node_id = query.node_id, port = session.reverse_ssh_port, "Session ready");
    Ok(envelope(&session))
}

/// `GET /api/v1/ssh/session/{id}/start`
pub async fn start_session(
    State(state): State<AppState>,
    PresignedAuth(auth): PresignedAuth,
    Path(id): Path<String>,
) -> Result<Json<Value>, TunnelError> {
    let session = state.activator.start(&id, &auth).await?;
    Ok(envelope(&session))
}

/// `GET /api/v1/ssh/session/{id}/stop`
pub async fn stop_session(
    State(state): State<AppState>,
    PresignedAuth(auth): PresignedAuth,
    Path(id): Path<String>,
) -> Result<Json<Value>, TunnelError> {
    let session = state.activator.stop(&id, &auth).await?;
    Ok(envelope(&session))
}
