//! Device-facing SSH handler.
//!
//! A device logs in with the session ID as username. Public key auth is
//! accepted for any key as long as that session exists; the session ID is the
//! credential. After login the device asks for reverse forwards of the
//! session's SSH and HTTP ports, which are bound on the loopback host.

use std::collections::HashMap;
use std::net::SocketAddr;

use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Session};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::bridge::BridgeEvent;
use super::{forward, reject, Endpoint, Login, Role};
use crate::error::TunnelError;
use crate::sessions::TransportLink;

pub struct DeviceHandler {
    endpoint: Endpoint,
    remote: SocketAddr,
    close: CancellationToken,
    session_id: Option<String>,
    login: Login,
    /// Active reverse forwards by port.
    forwards: HashMap<u32, CancellationToken>,
}

impl DeviceHandler {
    pub fn new(
        endpoint: Endpoint,
        remote: SocketAddr,
        close: CancellationToken,
        login: Login,
    ) -> Self {
        Self {
            endpoint,
            remote,
            close,
            session_id: None,
            login,
            forwards: HashMap::new(),
        }
    }

    /// `requested` as a local port, if it is one of the session's pair.
    async fn owned_port(&self, session_id: &str, requested: u32) -> Option<u16> {
        let local = u16::try_from(requested).ok()?;
        let session = self.endpoint.registry.find(session_id).await?;
        session.owns_port(local).then_some(local)
    }
}

impl Handler for DeviceHandler {
    type Error = TunnelError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let ip = self.remote.ip();
        if self.endpoint.deny.is_blocked(ip) {
            debug!(%ip, "Rejecting device login from blocked address");
            return Ok(reject());
        }
        if self.endpoint.registry.find(user).await.is_some() {
            self.session_id = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        debug!(user, "Rejecting device login for unknown session");
        self.endpoint.deny.record_failure(ip);
        Ok(reject())
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(session_id) = &self.session_id {
            let link = TransportLink::new(Some(self.remote), self.close.clone());
            self.login.set(session_id.clone(), link.id);
            self.endpoint.emit(BridgeEvent::ConnectAuthenticated {
                role: Role::Device,
                session_id: session_id.clone(),
                link,
            });
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(false);
        };
        let requested = *port;
        let Some(local_port) = self.owned_port(&session_id, requested).await else {
            warn!(session_id = %session_id, port = requested, "Refusing forward outside the session's port pair");
            return Ok(false);
        };

        let listener =
            match TcpListener::bind((self.endpoint.bind_host.as_str(), local_port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(session_id = %session_id, port = local_port, "Cannot bind reverse port: {e}");
                    return Ok(false);
                }
            };

        let stop = self.close.child_token();
        if let Some(previous) = self.forwards.insert(requested, stop.clone()) {
            previous.cancel();
        }
        let span = info_span!("forward", session_id = %session_id, port = local_port);
        tokio::spawn(
            forward::accept_forwarded(listener, session.handle(), address.to_string(), requested, stop)
                .instrument(span),
        );
        info!(session_id = %session_id, port = local_port, "Reverse forward listening");
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.forwards.remove(&port) {
            Some(stop) => {
                stop.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for DeviceHandler {
    fn drop(&mut self) {
        for stop in self.forwards.values() {
            stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;
    use tokio::sync::mpsc;
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::audit::NullAuditSink;
    use crate::config::DenyListConfig;
    use crate::sessions::ports::PortAllocator;
    use crate::sessions::SessionRegistry;
    use crate::ssh::deny::{DenyList, InMemoryDenyList};

    fn endpoint() -> (Endpoint, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(
            PortAllocator::unprobed(50000, 50010),
            "ssh.example.net",
            8022,
            Arc::new(NullAuditSink),
        );
        let deny = InMemoryDenyList::new(&DenyListConfig {
            max_failures: 2,
            ban_secs: 600,
        });
        let endpoint = Endpoint {
            registry,
            events,
            deny: Arc::new(deny),
            bind_host: "127.0.0.1".into(),
            tasks: TaskTracker::new(),
        };
        (endpoint, rx)
    }

    fn device_handler(endpoint: Endpoint, remote: SocketAddr) -> DeviceHandler {
        DeviceHandler::new(endpoint, remote, CancellationToken::new(), Login::default())
    }

    fn key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[tokio::test]
    async fn test_known_session_accepted() {
        let (endpoint, _rx) = endpoint();
        let session = endpoint.registry.create_session(1, &[]).await.unwrap();
        let mut handler = device_handler(endpoint, "10.0.0.5:4000".parse().unwrap());
        let auth = handler.auth_publickey(&session.id, &key()).await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(handler.session_id.as_deref(), Some(session.id.as_str()));
    }

    #[tokio::test]
    async fn test_forward_limited_to_session_ports() {
        let (endpoint, _rx) = endpoint();
        let first = endpoint.registry.create_session(1, &[]).await.unwrap();
        let second = endpoint.registry.create_session(2, &[]).await.unwrap();
        let handler = device_handler(endpoint, "10.0.0.5:4000".parse().unwrap());

        let ssh = u32::from(first.reverse_ssh_port);
        let http = u32::from(first.reverse_http_port);
        assert_eq!(handler.owned_port(&first.id, ssh).await, Some(first.reverse_ssh_port));
        assert_eq!(handler.owned_port(&first.id, http).await, Some(first.reverse_http_port));
        // Another session's pair, arbitrary ports, out of range
        assert_eq!(
            handler.owned_port(&first.id, u32::from(second.reverse_ssh_port)).await,
            None
        );
        assert_eq!(handler.owned_port(&first.id, 22).await, None);
        assert_eq!(handler.owned_port(&first.id, 70_000).await, None);
        assert_eq!(handler.owned_port("gone", ssh).await, None);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected_and_counted() {
        let (endpoint, _rx) = endpoint();
        let deny = Arc::clone(&endpoint.deny);
        let session = endpoint.registry.create_session(1, &[]).await.unwrap();
        let remote: SocketAddr = "10.0.0.6:4000".parse().unwrap();
        let mut handler = device_handler(endpoint, remote);

        for _ in 0..2 {
            let auth = handler.auth_publickey("bogus", &key()).await.unwrap();
            assert!(matches!(auth, Auth::Reject { .. }));
        }
        assert!(deny.is_blocked(remote.ip()));

        // Blocked even with the right session ID
        let auth = handler.auth_publickey(&session.id, &key()).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
    }

    #[tokio::test]
    async fn test_forwards_stop_when_handler_drops() {
        let (endpoint, _rx) = endpoint();
        let mut handler = device_handler(endpoint, "10.0.0.7:4000".parse().unwrap());
        let stop = CancellationToken::new();
        handler.forwards.insert(50000, stop.clone());
        drop(handler);
        assert!(stop.is_cancelled());
    }
}
