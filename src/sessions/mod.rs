//! Session registry: the single authority for creating, finding and
//! destroying tunnel sessions.
//!
//! [`SessionRegistry`] keeps two indexes, by session ID and by reverse SSH
//! port, behind one `RwLock` so no caller can see a session in one and not the
//! other. Port reservation is the insert into the port index; it happens under
//! the same write lock as the check that the pair is unclaimed.
//!
//! ## Concurrency
//!
//! Lookups take a read lock, mutations a write lock. Nothing awaits while
//! holding either lock: transport links are cancelled and audit records
//! emitted after the lock is released.
//!
//! ## Events
//!
//! [`SessionRegistry::subscribe`] yields [`RegistryEvent`]s so other
//! components (activation grace wait, proxy cache eviction) can react to
//! establishment and removal without polling.

pub mod ports;
pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditKind, SharedAuditSink};
use crate::backend::{Command, CommandId, CommandTopic, NodeId};
use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::util::now_ms;
use ports::PortAllocator;
pub use session::{close_matches, Session, TransportLink};

/// Registry state changes other components care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Established(String),
    Ended(String),
}

/// Internal bookkeeping for a session.
struct SessionEntry {
    session: Session,
    /// The device's reverse connection.
    device: Option<TransportLink>,
    /// The attached operator (terminal or direct SSH client).
    operator: Option<TransportLink>,
}

impl SessionEntry {
    fn close_links(&self) {
        for link in [&self.device, &self.operator].into_iter().flatten() {
            link.close.cancel();
        }
    }
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, SessionEntry>,
    by_port: BTreeMap<u16, String>,
}

impl Indexes {
    fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        let entry = self.by_id.remove(id)?;
        self.by_port.remove(&entry.session.reverse_ssh_port);
        Some(entry)
    }
}

/// Concurrent store of tunnel sessions.
///
/// Cloneable: all clones share the same indexes.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Indexes>>,
    ports: PortAllocator,
    ssh_host: String,
    ssh_port: u16,
    audit: SharedAuditSink,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new(
        ports: PortAllocator,
        ssh_host: impl Into<String>,
        ssh_port: u16,
        audit: SharedAuditSink,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Indexes::default())),
            ports,
            ssh_host: ssh_host.into(),
            ssh_port,
            audit,
            events,
        }
    }

    pub fn from_config(config: &Config, audit: SharedAuditSink) -> Self {
        let ports = PortAllocator::new(
            config.sessions.reverse_port_min,
            config.sessions.reverse_port_max,
            config.sessions.bind_host.clone(),
        );
        Self::new(ports, config.ssh.host.clone(), config.ssh.port, audit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create a session for `node_id`, or return the one already waiting on a
    /// pending start command for that node.
    ///
    /// `pending` is the node's list of not-yet-final commands, as reported by
    /// the command backend.
    pub async fn create_session(&self, node_id: NodeId, pending: &[Command]) -> Result<Session> {
        let waiting: Vec<CommandId> = pending
            .iter()
            .filter(|c| {
                c.node_id == node_id && c.is_topic(CommandTopic::StartTunnel) && c.state.is_pending()
            })
            .map(|c| c.id)
            .collect();
        if !waiting.is_empty() {
            let idx = self.inner.read().await;
            let existing = idx.by_id.values().find(|e| {
                e.session.node_id == node_id
                    && e.session
                        .start_command_id
                        .is_some_and(|id| waiting.contains(&id))
            });
            if let Some(entry) = existing {
                debug!(session_id = %entry.session.id, node_id, "Reusing session with pending start command");
                return Ok(entry.session.clone());
            }
        }

        for port in self.ports.candidates() {
            if self.inner.read().await.by_port.contains_key(&port) {
                continue;
            }
            if !self.ports.is_free(port) {
                continue;
            }

            let mut idx = self.inner.write().await;
            // Another caller may have claimed the pair between probe and lock
            if idx.by_port.contains_key(&port) {
                continue;
            }
            let session = Session {
                id: new_session_id(),
                created: now_ms(),
                node_id,
                ssh_host: self.ssh_host.clone(),
                ssh_port: self.ssh_port,
                reverse_ssh_port: port,
                reverse_http_port: port + 1,
                established: false,
                start_command_id: None,
                stop_command_id: None,
            };
            idx.by_port.insert(port, session.id.clone());
            idx.by_id.insert(
                session.id.clone(),
                SessionEntry {
                    session: session.clone(),
                    device: None,
                    operator: None,
                },
            );
            let total = idx.by_id.len();
            drop(idx);

            info!(session_id = %session.id, node_id, port, "Session created, total: {total}");
            self.audit
                .record(AuditEvent::for_session(AuditKind::Created, &session).rport(port));
            return Ok(session);
        }

        let (min, max) = self.ports.range();
        Err(TunnelError::ResourceExhausted { min, max })
    }

    pub async fn find(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .by_id
            .get(id)
            .map(|e| e.session.clone())
    }

    /// Close the session's transport links and remove it from both indexes.
    /// Returns the final snapshot if the session existed.
    pub async fn delete(&self, id: &str) -> Option<Session> {
        let entry = self.inner.write().await.remove(id)?;
        entry.close_links();
        info!(session_id = %id, port = entry.session.reverse_ssh_port, "Session ended");
        self.audit
            .record(AuditEvent::for_session(AuditKind::Ended, &entry.session));
        self.notify(RegistryEvent::Ended(id.to_string()));
        Some(entry.session)
    }

    /// Delete every session (used during shutdown).
    pub async fn delete_all(&self) {
        let ids: Vec<String> = self.inner.read().await.by_id.keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.delete(&id).await;
        }
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }

    /// Record the device's reverse connection and mark the session
    /// established. The link is stored before the flag flips, under one lock.
    pub async fn mark_established(&self, id: &str, link: TransportLink) -> Option<Session> {
        let mut idx = self.inner.write().await;
        let entry = idx.by_id.get_mut(id)?;
        entry.device = Some(link);
        entry.session.established = true;
        let session = entry.session.clone();
        drop(idx);
        self.notify(RegistryEvent::Established(id.to_string()));
        Some(session)
    }

    /// Remote address recorded for the session's device connection.
    #[cfg(test)]
    pub async fn device_remote_addr(&self, id: &str) -> Option<SocketAddr> {
        self.inner
            .read()
            .await
            .by_id
            .get(id)
            .and_then(|e| e.device.as_ref())
            .and_then(|l| l.remote_addr)
    }

    /// Handle a device disconnect: delete the session if the closing
    /// connection is the one last recorded (see [`close_matches`]).
    pub async fn device_closed(&self, id: &str, closing: Option<SocketAddr>) -> Option<Session> {
        let matches = {
            let idx = self.inner.read().await;
            let entry = idx.by_id.get(id)?;
            close_matches(entry.device.as_ref().and_then(|l| l.remote_addr), closing)
        };
        if !matches {
            debug!(session_id = %id, ?closing, "Ignoring close from stale device connection");
            return None;
        }
        self.delete(id).await
    }

    /// Handle an operator SSH disconnect: delete the session if `link_id` is
    /// still the recorded operator link.
    pub async fn operator_closed(&self, id: &str, link_id: u64) -> Option<Session> {
        let current = {
            let idx = self.inner.read().await;
            let entry = idx.by_id.get(id)?;
            entry.operator.as_ref().is_some_and(|l| l.id == link_id)
        };
        if !current {
            return None;
        }
        self.delete(id).await
    }

    pub async fn set_start_command(&self, id: &str, command_id: CommandId) -> Option<Session> {
        self.update(id, |s| s.start_command_id = Some(command_id)).await
    }

    pub async fn set_stop_command(&self, id: &str, command_id: CommandId) -> Option<Session> {
        self.update(id, |s| s.stop_command_id = Some(command_id)).await
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut Session)) -> Option<Session> {
        let mut idx = self.inner.write().await;
        let entry = idx.by_id.get_mut(id)?;
        f(&mut entry.session);
        Some(entry.session.clone())
    }

    /// Record an attached operator. Returns false if the session is gone.
    pub async fn attach_operator(&self, id: &str, link: TransportLink) -> bool {
        let mut idx = self.inner.write().await;
        match idx.by_id.get_mut(id) {
            Some(entry) => {
                entry.operator = Some(link);
                true
            }
            None => false,
        }
    }

    /// Clear the operator link, but only if it is still `link_id`.
    pub async fn detach_operator(&self, id: &str, link_id: u64) {
        let mut idx = self.inner.write().await;
        if let Some(entry) = idx.by_id.get_mut(id) {
            if entry.operator.as_ref().is_some_and(|l| l.id == link_id) {
                entry.operator = None;
            }
        }
    }

    #[cfg(test)]
    pub async fn has_operator(&self, id: &str) -> bool {
        self.inner
            .read()
            .await
            .by_id
            .get(id)
            .is_some_and(|e| e.operator.is_some())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub fn port_range(&self) -> (u16, u16) {
        self.ports.range()
    }

    /// Remove sessions that never became established within `window`.
    pub async fn reap_expired(&self, window: Duration) -> Vec<Session> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.reap_created_before(now_ms().saturating_sub(window_ms))
            .await
    }

    async fn reap_created_before(&self, cutoff: u64) -> Vec<Session> {
        let mut idx = self.inner.write().await;
        let expired: Vec<String> = idx
            .by_id
            .values()
            .filter(|e| !e.session.established && e.session.created < cutoff)
            .map(|e| e.session.id.clone())
            .collect();
        let removed: Vec<SessionEntry> = expired.iter().filter_map(|id| idx.remove(id)).collect();
        drop(idx);

        let mut sessions = Vec::with_capacity(removed.len());
        for entry in removed {
            entry.close_links();
            info!(session_id = %entry.session.id, "Session expired before establishment");
            self.audit
                .record(AuditEvent::for_session(AuditKind::Expired, &entry.session));
            self.notify(RegistryEvent::Ended(entry.session.id.clone()));
            sessions.push(entry.session);
        }
        sessions
    }
}

/// Session IDs double as the device's SSH username, so keep them to
/// alphanumerics.
fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::audit::testing::RecordingSink;
    use crate::backend::CommandState;

    fn registry_with(min: u16, max: u16) -> (SessionRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(
            PortAllocator::unprobed(min, max),
            "ssh.example.net",
            8022,
            sink.clone(),
        );
        (registry, sink)
    }

    fn start_command(id: CommandId, node_id: NodeId, state: CommandState) -> Command {
        Command {
            id,
            node_id,
            topic: CommandTopic::StartTunnel.as_str().to_string(),
            state,
        }
    }

    #[tokio::test]
    async fn test_first_allocation_is_bottom_of_range() {
        let (registry, sink) = registry_with(50000, 50010);
        let s = registry.create_session(1, &[]).await.unwrap();
        assert_eq!(s.reverse_ssh_port, 50000);
        assert_eq!(s.reverse_http_port, 50001);
        assert_eq!(s.ssh_host, "ssh.example.net");
        assert_eq!(s.ssh_port, 8022);
        assert!(!s.established);
        let s2 = registry.create_session(2, &[]).await.unwrap();
        assert_eq!(s2.reverse_ssh_port, 50002);
        assert_eq!(sink.kinds(), vec![AuditKind::Created, AuditKind::Created]);
    }

    #[tokio::test]
    async fn test_busy_pair_skipped_silently() {
        // Something outside the registry holds a port of the first pair
        let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let first = held.local_addr().unwrap().port() & !1;
        let registry = SessionRegistry::new(
            PortAllocator::new(first, first + 4, "127.0.0.1"),
            "ssh.example.net",
            8022,
            Arc::new(crate::audit::NullAuditSink),
        );

        let s = registry.create_session(1, &[]).await.unwrap();
        assert_eq!(s.reverse_ssh_port, first + 2);
        assert_eq!(s.reverse_http_port, first + 3);

        let err = registry.create_session(2, &[]).await.unwrap_err();
        assert!(matches!(err, TunnelError::ResourceExhausted { .. }));
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_distinct_even_ports() {
        let (registry, _) = registry_with(50000, 50010);
        let mut handles = Vec::new();
        for node in 0..5 {
            let r = registry.clone();
            handles.push(tokio::spawn(async move { r.create_session(node, &[]).await }));
        }
        let mut ports = HashSet::new();
        for h in handles {
            let s = h.await.unwrap().unwrap();
            assert_eq!(s.reverse_ssh_port % 2, 0);
            assert!((50000..50010).contains(&s.reverse_ssh_port));
            assert!(ports.insert(s.reverse_ssh_port));
        }
        assert_eq!(ports.len(), 5);

        let err = registry.create_session(99, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::ResourceExhausted {
                min: 50000,
                max: 50010
            }
        ));
    }

    #[tokio::test]
    async fn test_pending_start_command_reuses_session() {
        let (registry, _) = registry_with(50000, 50010);
        let first = registry.create_session(7, &[]).await.unwrap();
        registry.set_start_command(&first.id, 77).await.unwrap();

        let pending = vec![start_command(77, 7, CommandState::Queued)];
        let again = registry.create_session(7, &pending).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.reverse_ssh_port, first.reverse_ssh_port);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_completed_or_foreign_commands_do_not_reuse() {
        let (registry, _) = registry_with(50000, 50010);
        let first = registry.create_session(7, &[]).await.unwrap();
        registry.set_start_command(&first.id, 77).await.unwrap();

        let done = vec![start_command(77, 7, CommandState::Completed)];
        let second = registry.create_session(7, &done).await.unwrap();
        assert_ne!(second.id, first.id);

        let other_node = vec![start_command(77, 8, CommandState::Queued)];
        let third = registry.create_session(8, &other_node).await.unwrap();
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_delete_releases_pair_and_closes_links() {
        let (registry, sink) = registry_with(50000, 50004);
        let s = registry.create_session(1, &[]).await.unwrap();
        let device = CancellationToken::new();
        let operator = CancellationToken::new();
        registry
            .mark_established(&s.id, TransportLink::new(None, device.clone()))
            .await
            .unwrap();
        assert!(registry.attach_operator(&s.id, TransportLink::new(None, operator.clone())).await);

        let ended = registry.delete(&s.id).await.unwrap();
        assert!(ended.established);
        assert!(device.is_cancelled());
        assert!(operator.is_cancelled());
        assert!(registry.find(&s.id).await.is_none());
        assert!(registry.delete(&s.id).await.is_none());

        let reused = registry.create_session(2, &[]).await.unwrap();
        assert_eq!(reused.reverse_ssh_port, 50000);
        assert_eq!(reused.reverse_http_port, 50001);
        assert_eq!(
            sink.kinds(),
            vec![AuditKind::Created, AuditKind::Ended, AuditKind::Created]
        );
    }

    #[tokio::test]
    async fn test_reaper_removes_only_unestablished() {
        let (registry, sink) = registry_with(50000, 50010);
        let waiting = registry.create_session(1, &[]).await.unwrap();
        let live = registry.create_session(2, &[]).await.unwrap();
        registry
            .mark_established(&live.id, TransportLink::new(None, CancellationToken::new()))
            .await
            .unwrap();

        let reaped = registry.reap_created_before(now_ms() + 1).await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, waiting.id);
        assert!(registry.find(&waiting.id).await.is_none());
        assert!(registry.find(&live.id).await.is_some());
        assert!(sink.kinds().contains(&AuditKind::Expired));

        // The expired pair is free again
        let next = registry.create_session(3, &[]).await.unwrap();
        assert_eq!(next.reverse_ssh_port, waiting.reverse_ssh_port);
    }

    #[tokio::test]
    async fn test_reaper_keeps_fresh_sessions() {
        let (registry, _) = registry_with(50000, 50010);
        registry.create_session(1, &[]).await.unwrap();
        let reaped = registry.reap_expired(Duration::from_secs(300)).await;
        assert!(reaped.is_empty());
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_device_close_requires_matching_address() {
        let (registry, _) = registry_with(50000, 50010);
        let s = registry.create_session(1, &[]).await.unwrap();
        let current: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let stale: SocketAddr = "10.0.0.1:3999".parse().unwrap();
        registry
            .mark_established(
                &s.id,
                TransportLink::new(Some(current), CancellationToken::new()),
            )
            .await
            .unwrap();
        assert_eq!(registry.device_remote_addr(&s.id).await, Some(current));

        assert!(registry.device_closed(&s.id, Some(stale)).await.is_none());
        assert!(registry.find(&s.id).await.is_some());

        assert!(registry.device_closed(&s.id, Some(current)).await.is_some());
        assert!(registry.find(&s.id).await.is_none());
    }

    #[tokio::test]
    async fn test_established_event_published() {
        let (registry, _) = registry_with(50000, 50010);
        let mut events = registry.subscribe();
        let s = registry.create_session(1, &[]).await.unwrap();
        registry
            .mark_established(&s.id, TransportLink::new(None, CancellationToken::new()))
            .await
            .unwrap();
        registry.delete(&s.id).await;
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Established(s.id.clone())
        );
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Ended(s.id));
    }

    #[tokio::test]
    async fn test_detach_only_clears_same_link() {
        let (registry, _) = registry_with(50000, 50010);
        let s = registry.create_session(1, &[]).await.unwrap();
        let old = TransportLink::new(None, CancellationToken::new());
        let new = TransportLink::new(None, CancellationToken::new());
        registry.attach_operator(&s.id, old.clone()).await;
        registry.attach_operator(&s.id, new.clone()).await;
        registry.detach_operator(&s.id, old.id).await;
        assert!(registry.has_operator(&s.id).await);
        registry.detach_operator(&s.id, new.id).await;
        assert!(!registry.has_operator(&s.id).await);
    }
}
