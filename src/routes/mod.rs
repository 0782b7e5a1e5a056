//! HTTP route handlers and the router that mounts them.
//!
//! | Method | Path                                | Auth       | Description                    |
//! |--------|-------------------------------------|------------|--------------------------------|
//! | GET    | `/api/health`                       | No         | Liveness probe                 |
//! | GET    | `/api/v1/ssh/session/new?nodeId=`   | Pre-signed | Create or reuse a session      |
//! | GET    | `/api/v1/ssh/session/{id}/start`    | Pre-signed | Issue the start-tunnel command |
//! | GET    | `/api/v1/ssh/session/{id}/stop`     | Pre-signed | Stop the tunnel, end session   |
//! | GET    | `/ws/terminal?sessionId=`           | Attach msg | Browser terminal WebSocket     |
//! | ANY    | `/proxy/{sessionId}/**`             | Session ID | Device web UI                  |

pub mod health;
pub mod sessions;

use axum::{
    http::{header, HeaderName, Method},
    routing::{any, get},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{PRESIGNED_AUTHORIZATION_HEADER, SIGNED_DATE_HEADER};
use crate::state::AppState;
use crate::{proxy, terminal};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(PRESIGNED_AUTHORIZATION_HEADER),
            HeaderName::from_static(SIGNED_DATE_HEADER),
        ]);

    let api = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/v1/ssh/session/new", get(sessions::new_session))
        .route("/api/v1/ssh/session/{id}/start", get(sessions::start_session))
        .route("/api/v1/ssh/session/{id}/stop", get(sessions::stop_session))
        .layer(cors);

    Router::new()
        .merge(api)
        .route("/ws/terminal", get(terminal::terminal_upgrade))
        .route("/proxy/{session_id}", any(proxy::proxy_request))
        .route("/proxy/{session_id}/{*rest}", any(proxy::proxy_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
