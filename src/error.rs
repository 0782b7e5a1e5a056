//! Failure taxonomy shared by every component.
//!
//! Internally the workflow distinguishes why an activation failed (bad
//! credentials, device declined, poll budget exhausted, caller went away).
//! At the HTTP/WebSocket/SSH boundary those collapse onto three surfaces:
//!
//! | Surface                | Status | Variants                                           |
//! |------------------------|--------|----------------------------------------------------|
//! | `AuthorizationFailure` | 403    | `AuthFailure`, `Declined`, `Timeout`, `Cancelled`  |
//! | `ResourceExhausted`    | 503    | `ResourceExhausted`                                |
//! | `CommunicationFailure` | 502    | `CommunicationFailure`, `Io`, `Ssh`, `Http`        |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("not authorized: {0}")]
    AuthFailure(String),

    #[error("no available port pair in range {min}..{max}")]
    ResourceExhausted { min: u16, max: u16 },

    #[error("communication failure: {0}")]
    CommunicationFailure(String),

    #[error("command {0} declined by node")]
    Declined(i64),

    #[error("node did not complete command {0} in time")]
    Timeout(i64),

    #[error("activation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// What a caller outside the core gets to see of a [`TunnelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthorizationFailure,
    ResourceExhausted,
    CommunicationFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationFailure => "AuthorizationFailure",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::CommunicationFailure => "CommunicationFailure",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::AuthorizationFailure => StatusCode::FORBIDDEN,
            Self::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Self::CommunicationFailure => StatusCode::BAD_GATEWAY,
        }
    }
}

impl TunnelError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthFailure(msg.into())
    }

    pub fn comms(msg: impl Into<String>) -> Self {
        Self::CommunicationFailure(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthFailure(_) | Self::Declined(_) | Self::Timeout(_) | Self::Cancelled => {
                ErrorKind::AuthorizationFailure
            }
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::CommunicationFailure(_) | Self::Io(_) | Self::Ssh(_) | Self::Http(_) => {
                ErrorKind::CommunicationFailure
            }
        }
    }

    /// Message safe to hand to a remote caller. Declines and timeouts are
    /// reported as plain authorization failures so device state does not leak.
    pub fn public_message(&self) -> String {
        match self {
            Self::Declined(_) | Self::Timeout(_) | Self::Cancelled => "Not authorized".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        (
            kind.status(),
            Json(json!({
                "success": false,
                "code": kind.as_str(),
                "message": self.public_message(),
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
