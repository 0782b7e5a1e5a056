//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version and the number of live tunnel sessions.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.registry.session_count().await;
    let (port_min, port_max) = state.registry.port_range();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "reverse_ports": {
            "min": port_min,
            "max": port_max,
        },
    }))
}
