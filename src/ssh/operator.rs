//! Operator-facing SSH handler.
//!
//! Username `nodeId:tokenId`, password the token secret. Password
//! authentication runs the whole activation workflow, so a successful login
//! means the device tunnel is up. Afterwards `direct-tcpip` channels reach the
//! device: port 22 maps to the session's reverse SSH port, 80 and 8080 to its
//! reverse HTTP port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{Auth, Handler, Msg, Session as SshSession};
use russh::Channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::bridge::BridgeEvent;
use super::{forward, reject, Endpoint, Login, Role};
use crate::activation::Activator;
use crate::backend::NodeId;
use crate::error::TunnelError;
use crate::sessions::{Session, TransportLink};

pub struct OperatorHandler {
    endpoint: Endpoint,
    activator: Arc<Activator>,
    auth_timeout: Duration,
    remote: SocketAddr,
    close: CancellationToken,
    session: Option<Session>,
    login: Login,
}

impl OperatorHandler {
    pub fn new(
        endpoint: Endpoint,
        activator: Arc<Activator>,
        auth_timeout: Duration,
        remote: SocketAddr,
        close: CancellationToken,
        login: Login,
    ) -> Self {
        Self {
            endpoint,
            activator,
            auth_timeout,
            remote,
            close,
            session: None,
            login,
        }
    }
}

/// Split `nodeId:tokenId`.
fn parse_login(user: &str) -> Option<(NodeId, &str)> {
    let (node, token) = user.split_once(':')?;
    let node_id = node.trim().parse().ok()?;
    let token = token.trim();
    (!token.is_empty()).then_some((node_id, token))
}

/// Loopback port a `direct-tcpip` request for `port` is sent to.
fn direct_target(session: &Session, port: u32) -> Option<u16> {
    match port {
        22 => Some(session.reverse_ssh_port),
        80 | 8080 => Some(session.reverse_http_port),
        _ => None,
    }
}

impl Handler for OperatorHandler {
    type Error = TunnelError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let ip = self.remote.ip();
        if self.endpoint.deny.is_blocked(ip) {
            debug!(%ip, "Rejecting operator login from blocked address");
            return Ok(reject());
        }
        let Some((node_id, token_id)) = parse_login(user) else {
            debug!(user, "Operator username is not nodeId:tokenId");
            self.endpoint.deny.record_failure(ip);
            return Ok(reject());
        };

        // Shutdown, client loss or the auth timeout cancels the activation,
        // which then stops the device tunnel on its own task.
        let cancel = self.close.child_token();
        let _abandon = cancel.clone().drop_guard();
        let activator = Arc::clone(&self.activator);
        let token = token_id.to_string();
        let secret = password.to_string();
        let attempt = self.endpoint.tasks.spawn(
            async move { activator.activate(node_id, &token, &secret, &cancel).await }
                .instrument(info_span!("activation", node_id)),
        );

        match tokio::time::timeout(self.auth_timeout, attempt).await {
            Ok(Ok(Ok(session))) => {
                info!(session_id = %session.id, node_id, "Operator activation complete");
                self.session = Some(session);
                Ok(Auth::Accept)
            }
            Ok(Ok(Err(e))) => {
                // Only bad credentials count; declines and cancels do not
                if matches!(e, TunnelError::AuthFailure(_)) {
                    self.endpoint.deny.record_failure(ip);
                }
                info!(node_id, "Operator activation failed: {e}");
                Ok(reject())
            }
            Ok(Err(e)) => {
                warn!(node_id, "Activation task failed: {e}");
                Ok(reject())
            }
            Err(_) => {
                warn!(node_id, "Activation exceeded the authentication timeout");
                Ok(reject())
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut SshSession) -> Result<(), Self::Error> {
        if let Some(session) = &self.session {
            let link = TransportLink::new(Some(self.remote), self.close.clone());
            self.login.set(session.id.clone(), link.id);
            self.endpoint.emit(BridgeEvent::ConnectAuthenticated {
                role: Role::Operator,
                session_id: session.id.clone(),
                link,
            });
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        // Plain `ssh -L` clients open a session channel; it carries nothing
        Ok(self.session.is_some())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let Some(session) = &self.session else {
            return Ok(false);
        };
        let Some(target) = direct_target(session, port_to_connect) else {
            warn!(session_id = %session.id, host = host_to_connect, port = port_to_connect, "Refusing direct-tcpip target");
            return Ok(false);
        };
        debug!(session_id = %session.id, port = port_to_connect, target, "Opening direct-tcpip");
        let span = info_span!("direct", session_id = %session.id, port = target);
        tokio::spawn(
            forward::relay_direct(channel, self.endpoint.bind_host.clone(), target).instrument(span),
        );
        Ok(true)
    }
}
