//! Translates SSH connection events into session registry mutations.
//!
//! The russh handlers never touch the registry for state transitions. They
//! (and the accept loop, once a connection ends) push [`BridgeEvent`]s onto
//! an unbounded queue, and a single
//! [`SessionBridge`] task applies them in order: establishment, disconnect
//! handling (with the close-matching rule) and the matching audit records.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Role;
use crate::audit::{AuditEvent, AuditKind, SharedAuditSink};
use crate::sessions::{SessionRegistry, TransportLink};

#[derive(Debug)]
pub enum BridgeEvent {
    /// A connection authenticated as `session_id`.
    ConnectAuthenticated {
        role: Role,
        session_id: String,
        link: TransportLink,
    },
    /// An authenticated connection went away, cleanly or with `error`.
    Closed {
        role: Role,
        session_id: String,
        remote: Option<SocketAddr>,
        link_id: u64,
        error: Option<String>,
    },
    /// The transport failed underneath a connection that never logged in.
    Exception {
        role: Role,
        remote: Option<SocketAddr>,
        error: String,
    },
}

pub type BridgeSender = mpsc::UnboundedSender<BridgeEvent>;

pub struct SessionBridge {
    registry: SessionRegistry,
    audit: SharedAuditSink,
}

impl SessionBridge {
    pub fn new(registry: SessionRegistry, audit: SharedAuditSink) -> Self {
        Self { registry, audit }
    }

    /// Start applying events. The task ends once every sender is dropped.
    pub fn spawn(self) -> (BridgeSender, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.apply(event).await;
            }
            debug!("Session bridge stopped");
        });
        (tx, task)
    }

    pub async fn apply(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::ConnectAuthenticated {
                role: Role::Device,
                session_id,
                link,
            } => {
                let remote = link.remote_addr;
                let close = link.close.clone();
                match self.registry.mark_established(&session_id, link).await {
                    Some(session) => {
                        info!(session_id = %session_id, ?remote, "Device connected");
                        self.audit.record(
                            AuditEvent::for_session(AuditKind::DeviceConnected, &session)
                                .remote(remote)
                                .rport(session.reverse_ssh_port),
                        );
                    }
                    None => {
                        warn!(session_id = %session_id, "Device authenticated for a session that is gone");
                        close.cancel();
                    }
                }
            }
            BridgeEvent::ConnectAuthenticated {
                role: Role::Operator,
                session_id,
                link,
            } => {
                let remote = link.remote_addr;
                let close = link.close.clone();
                if !self.registry.attach_operator(&session_id, link).await {
                    warn!(session_id = %session_id, "Operator authenticated for a session that is gone");
                    close.cancel();
                    return;
                }
                if let Some(session) = self.registry.find(&session_id).await {
                    info!(session_id = %session_id, ?remote, "Operator connected");
                    self.audit.record(
                        AuditEvent::for_session(AuditKind::OperatorConnected, &session)
                            .remote(remote)
                            .rport(session.reverse_ssh_port),
                    );
                }
            }
            BridgeEvent::Closed {
                role,
                session_id,
                remote,
                link_id,
                error,
            } => {
                let kind = match role {
                    Role::Device => AuditKind::DeviceDisconnected,
                    Role::Operator => AuditKind::OperatorDisconnected,
                };
                let record = match self.registry.find(&session_id).await {
                    Some(session) => AuditEvent::for_session(kind, &session),
                    None => AuditEvent::for_identity(kind, &session_id),
                };
                let record = record.remote(remote);
                let record = match error {
                    Some(error) => {
                        warn!(session_id = %session_id, ?remote, role = role.as_str(), "Connection failed: {error}");
                        record.error(error)
                    }
                    None => {
                        info!(session_id = %session_id, ?remote, role = role.as_str(), "Connection closed");
                        record
                    }
                };
                self.audit.record(record);

                match role {
                    Role::Device => self.registry.device_closed(&session_id, remote).await,
                    Role::Operator => self.registry.operator_closed(&session_id, link_id).await,
                };
            }
            BridgeEvent::Exception {
                role,
                remote,
                error,
            } => {
                warn!(role = role.as_str(), ?remote, "SSH connection error: {error}");
            }
        }
    }
}
