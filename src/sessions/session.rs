//! The tunnel session record and its transport links.
//!
//! A [`Session`] is a plain snapshot: the registry hands out clones and keeps
//! the authoritative copy. Live transport connections are tracked beside it as
//! [`TransportLink`]s, which only carry enough to identify and close the
//! connection. The registry never owns the connection itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{CommandId, NodeId};

/// One device-to-operator tunnel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub id: String,
    /// Epoch milliseconds.
    pub created: u64,
    pub node_id: NodeId,
    #[serde(rename = "host")]
    pub ssh_host: String,
    #[serde(rename = "port")]
    pub ssh_port: u16,
    #[serde(rename = "reversePort")]
    pub reverse_ssh_port: u16,
    /// Always `reverse_ssh_port + 1`.
    #[serde(skip)]
    pub reverse_http_port: u16,
    pub established: bool,
    #[serde(rename = "startInstructionId", skip_serializing_if = "Option::is_none")]
    pub start_command_id: Option<CommandId>,
    #[serde(rename = "stopInstructionId", skip_serializing_if = "Option::is_none")]
    pub stop_command_id: Option<CommandId>,
}

impl Session {
    /// Does `port` belong to this session's reserved pair?
    pub fn owns_port(&self, port: u16) -> bool {
        port == self.reverse_ssh_port || port == self.reverse_http_port
    }
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// A back-reference to a live transport connection.
///
/// Cancelling `close` asks the owner of the connection to shut it down.
#[derive(Debug, Clone)]
pub struct TransportLink {
    pub id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub close: CancellationToken,
}

impl TransportLink {
    pub fn new(remote_addr: Option<SocketAddr>, close: CancellationToken) -> Self {
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            close,
        }
    }
}

/// Close-matching rule for device disconnects: only the connection that was
/// last recorded may end the session. A missing address on either side counts
/// as a match.
pub fn close_matches(recorded: Option<SocketAddr>, closing: Option<SocketAddr>) -> bool {
    match (recorded, closing) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session {
            id: "S123".into(),
            created: 1_700_000_000_000,
            node_id: 42,
            ssh_host: "ssh.example.net".into(),
            ssh_port: 8022,
            reverse_ssh_port: 50000,
            reverse_http_port: 50001,
            established: false,
            start_command_id: Some(9),
            stop_command_id: None,
        }
    }

    #[test]
    fn test_session_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["sessionId"], "S123");
        assert_eq!(json["created"], 1_700_000_000_000_u64);
        assert_eq!(json["nodeId"], 42);
        assert_eq!(json["host"], "ssh.example.net");
        assert_eq!(json["port"], 8022);
        assert_eq!(json["reversePort"], 50000);
        assert_eq!(json["startInstructionId"], 9);
        assert_eq!(json["established"], false);
        assert!(json.get("stopInstructionId").is_none());
        assert!(json.get("reverseHttpPort").is_none());
    }

    #[test]
    fn test_owns_port() {
        let s = sample();
        assert!(s.owns_port(50000));
        assert!(s.owns_port(50001));
        assert!(!s.owns_port(50002));
        assert!(!s.owns_port(8022));
    }

    #[test]
    fn test_close_matches() {
        let a: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:4001".parse().unwrap();
        assert!(close_matches(Some(a), Some(a)));
        assert!(!close_matches(Some(a), Some(b)));
        assert!(close_matches(None, Some(b)));
        assert!(close_matches(Some(a), None));
        assert!(close_matches(None, None));
    }

    #[test]
    fn test_link_ids_are_unique() {
        let a = TransportLink::new(None, CancellationToken::new());
        let b = TransportLink::new(None, CancellationToken::new());
        assert_ne!(a.id, b.id);
    }
}
