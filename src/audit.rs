//! Structured audit records for session state transitions.
//!
//! Every transition (session created, device connected/disconnected, operator
//! connected/disconnected, session ended/expired) produces an [`AuditEvent`].
//! Formatting and storage belong to the [`AuditSink`]; the default
//! [`TracingAuditSink`] writes one JSON object per record under the
//! `dialback::audit` tracing target.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::sessions::Session;
use crate::util::now_ms;

/// Audit event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditKind {
    #[serde(rename = "NEW")]
    Created,
    #[serde(rename = "DEVICE-CONNECT")]
    DeviceConnected,
    #[serde(rename = "DEVICE-DISCONNECT")]
    DeviceDisconnected,
    #[serde(rename = "DIRECT-CONNECT")]
    OperatorConnected,
    #[serde(rename = "DIRECT-DISCONNECT")]
    OperatorDisconnected,
    #[serde(rename = "END")]
    Ended,
    #[serde(rename = "EXPIRE")]
    Expired,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "NEW",
            Self::DeviceConnected => "DEVICE-CONNECT",
            Self::DeviceDisconnected => "DEVICE-DISCONNECT",
            Self::OperatorConnected => "DIRECT-CONNECT",
            Self::OperatorDisconnected => "DIRECT-DISCONNECT",
            Self::Ended => "END",
            Self::Expired => "EXPIRE",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event: AuditKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
    /// Epoch milliseconds.
    pub date: u64,
    /// Whole seconds since the session was created, rounded up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// Record for a known session; `duration` is filled for everything but
    /// [`AuditKind::Created`].
    pub fn for_session(kind: AuditKind, session: &Session) -> Self {
        let date = now_ms();
        let duration = (kind != AuditKind::Created)
            .then(|| date.saturating_sub(session.created).div_ceil(1000));
        Self {
            event: kind,
            session_id: session.id.clone(),
            node_id: Some(session.node_id),
            date,
            duration,
            remote_address: None,
            rport: None,
            error: None,
        }
    }

    /// Record for an identity that no longer (or never) matched a session.
    pub fn for_identity(kind: AuditKind, session_id: &str) -> Self {
        Self {
            event: kind,
            session_id: session_id.to_string(),
            node_id: None,
            date: now_ms(),
            duration: None,
            remote_address: None,
            rport: None,
            error: None,
        }
    }

    #[must_use]
    pub fn remote(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_address = addr.map(|a| a.to_string());
        self
    }

    #[must_use]
    pub fn rport(mut self, port: u16) -> Self {
        self.rport = Some(port);
        self
    }

    #[must_use]
    pub fn error(mut self, err: impl Into<String>) -> Self {
        self.error = Some(err.into());
        self
    }

    /// The record as a flat JSON map.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit records as JSON through `tracing`.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = Value::Object(event.to_map()).to_string();
        info!(target: "dialback::audit", "{line}");
    }
}

/// Discards everything (used when `[logging] audit = false`).
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

pub type SharedAuditSink = Arc<dyn AuditSink>;
