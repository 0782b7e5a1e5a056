//! SSH transport endpoints.
//!
//! Two russh servers share this module:
//!
//! - **Device endpoint** ([`device::DeviceHandler`]): devices dial back here
//!   with the session ID as their username and request reverse forwards for
//!   the session's port pair.
//! - **Operator endpoint** ([`operator::OperatorHandler`]): operators log in
//!   as `nodeId:tokenId` with the token secret as password. The login runs
//!   the full activation workflow before it is accepted.
//!
//! Handlers only report what happened on the wire. State transitions are
//! applied by [`bridge::SessionBridge`] from the events they queue.

pub mod bridge;
pub mod deny;
pub mod device;
mod forward;
pub mod operator;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use russh::server;
use russh::{Disconnect, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SshConfig;
use crate::error::{Result, TunnelError};
use crate::sessions::SessionRegistry;
use bridge::{BridgeEvent, BridgeSender};
use deny::DenyList;

/// Which side of the tunnel a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Device,
    Operator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Operator => "operator",
        }
    }
}

/// What every connection handler needs.
#[derive(Clone)]
pub struct Endpoint {
    pub registry: SessionRegistry,
    pub events: BridgeSender,
    pub deny: Arc<dyn DenyList>,
    /// Host reverse ports are bound and dialled on.
    pub bind_host: String,
    /// Activations started by operator logins. Shutdown waits on these so
    /// their compensating stop gets out.
    pub tasks: TaskTracker,
}

impl Endpoint {
    fn emit(&self, event: BridgeEvent) {
        if self.events.send(event).is_err() {
            debug!("Session bridge gone, dropping event");
        }
    }
}

/// Who a connection authenticated as. The handler fills it in at login; the
/// accept loop reads it once the connection is over.
#[derive(Debug, Clone, Default)]
pub struct Login(Arc<Mutex<Option<(String, u64)>>>);

impl Login {
    pub fn set(&self, session_id: String, link_id: u64) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some((session_id, link_id));
        }
    }

    pub fn take(&self) -> Option<(String, u64)> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Load the configured host key, or generate an ephemeral Ed25519 key.
pub fn load_host_key(config: &SshConfig) -> Result<PrivateKey> {
    match &config.host_key_path {
        Some(path) => {
            info!("Loading SSH host key from {path}");
            russh::keys::load_secret_key(path, config.host_key_password.as_deref())
                .map_err(|e| TunnelError::comms(format!("failed to load host key {path}: {e}")))
        }
        None => {
            warn!("No ssh.host_key_path configured, generating an ephemeral Ed25519 host key");
            PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                .map_err(|e| TunnelError::comms(format!("failed to generate host key: {e}")))
        }
    }
}

/// russh server settings shared by both endpoints.
pub fn server_config(key: PrivateKey, methods: &[MethodKind]) -> Arc<server::Config> {
    Arc::new(server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: Some(Duration::from_secs(30)),
        methods: MethodSet::from(methods),
        keys: vec![key],
        ..Default::default()
    })
}

/// Accept connections until `shutdown` fires, running each on its own task.
///
/// Every connection gets a child token of `shutdown`; cancelling it (session
/// deleted, or shutdown) disconnects the client. When an authenticated
/// connection ends, a [`BridgeEvent::Closed`] carrying any transport error is
/// queued.
pub async fn serve<H, F>(
    listener: TcpListener,
    config: Arc<server::Config>,
    role: Role,
    events: BridgeSender,
    shutdown: CancellationToken,
    mut new_handler: F,
) where
    H: server::Handler<Error = TunnelError> + Send + 'static,
    F: FnMut(SocketAddr, CancellationToken, Login) -> H,
{
    if let Ok(addr) = listener.local_addr() {
        info!(role = role.as_str(), "SSH endpoint listening on {addr}");
    }
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(role = role.as_str(), "Accept failed: {e}");
                    continue;
                }
            },
        };
        let close = shutdown.child_token();
        let login = Login::default();
        let handler = new_handler(peer, close.clone(), login.clone());
        let config = Arc::clone(&config);
        let events = events.clone();
        let span = info_span!("ssh", role = role.as_str(), %peer);
        tokio::spawn(
            async move {
                debug!("Connection accepted");
                let error = run_connection(config, stream, handler, close)
                    .await
                    .err()
                    .map(|e| e.to_string());
                let event = match (login.take(), error) {
                    (Some((session_id, link_id)), error) => BridgeEvent::Closed {
                        role,
                        session_id,
                        remote: Some(peer),
                        link_id,
                        error,
                    },
                    (None, Some(error)) => BridgeEvent::Exception {
                        role,
                        remote: Some(peer),
                        error,
                    },
                    (None, None) => return,
                };
                let _ = events.send(event);
            }
            .instrument(span),
        );
    }
    info!(role = role.as_str(), "SSH endpoint stopped");
}

async fn run_connection<H>(
    config: Arc<server::Config>,
    stream: TcpStream,
    handler: H,
    close: CancellationToken,
) -> Result<()>
where
    H: server::Handler<Error = TunnelError> + Send + 'static,
{
    let session = server::run_stream(config, stream, handler).await?;
    let handle = session.handle();
    tokio::pin!(session);
    tokio::select! {
        result = &mut session => result,
        () = close.cancelled() => {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "session closed".into(), "en".into())
                .await;
            // Let the connection wind down so the handler is dropped
            let _ = tokio::time::timeout(Duration::from_secs(5), &mut session).await;
            Ok(())
        }
    }
}

fn reject() -> server::Auth {
    server::Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_when_unconfigured() {
        let key = load_host_key(&SshConfig::default()).unwrap();
        assert_eq!(key.algorithm(), Algorithm::Ed25519);
    }

    #[test]
    fn test_login_taken_once() {
        let login = Login::default();
        assert_eq!(login.take(), None);
        login.clone().set("S1".into(), 4);
        assert_eq!(login.take(), Some(("S1".to_string(), 4)));
        assert_eq!(login.take(), None);
    }

    #[test]
    fn test_missing_key_file_is_error() {
        let config = SshConfig {
            host_key_path: Some("/nonexistent/dialback/host_key".into()),
            ..SshConfig::default()
        };
        assert!(load_host_key(&config).is_err());
    }
}
