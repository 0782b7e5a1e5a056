//! Remote activation: bring a device's reverse tunnel up on demand.
//!
//! The full workflow ([`Activator::activate`]) runs when an operator logs in
//! with `nodeId:tokenId` and a token secret:
//!
//! 1. Authenticate the actor.
//! 2. Create (or reuse) a session for the node.
//! 3. Issue a start-tunnel command carrying `host`, `user`, `port`, `rport`.
//! 4. Poll the command state every `poll_interval` until `Completed`,
//!    `Declined`, the wait budget runs out, or the caller cancels.
//! 5. After `Completed`, wait up to `grace` for the device connection to be
//!    established.
//!
//! Any failure after the start command was accepted issues a best-effort
//! stop-tunnel command and deletes the session.
//!
//! The HTTP surface uses the smaller pieces ([`Activator::create`],
//! [`Activator::start`], [`Activator::stop`]) with a pre-signed
//! authorization and never blocks on the device.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    ActorAuthenticator, Authorization, CommandBackend, CommandId, CommandParams, CommandState,
    CommandTopic, NodeId,
};
use crate::config::ActivationConfig;
use crate::error::{Result, TunnelError};
use crate::sessions::{RegistryEvent, Session, SessionRegistry};

pub struct Activator {
    registry: SessionRegistry,
    backend: Arc<dyn CommandBackend>,
    actors: Arc<dyn ActorAuthenticator>,
    poll_interval: Duration,
    wait_budget: Duration,
    grace: Duration,
}

impl Activator {
    pub fn new(
        registry: SessionRegistry,
        backend: Arc<dyn CommandBackend>,
        actors: Arc<dyn ActorAuthenticator>,
        config: &ActivationConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            actors,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            wait_budget: Duration::from_secs(config.wait_secs),
            grace: Duration::from_millis(config.grace_ms),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn CommandBackend> {
        &self.backend
    }

    /// Create a session for `node_id`, reusing one whose start command is
    /// still pending.
    pub async fn create(&self, node_id: NodeId, auth: &Authorization) -> Result<Session> {
        let pending = self.backend.pending_commands(node_id, auth).await?;
        self.registry.create_session(node_id, &pending).await
    }

    /// Issue the start-tunnel command for an existing session.
    pub async fn start(&self, session_id: &str, auth: &Authorization) -> Result<Session> {
        let session = self.known(session_id).await?;
        let command_id = self
            .backend
            .issue_command(
                session.node_id,
                CommandTopic::StartTunnel,
                &CommandParams::for_session(&session),
                auth,
            )
            .await?;
        info!(session_id, command_id, "Start tunnel command issued");
        self.registry
            .set_start_command(session_id, command_id)
            .await
            .ok_or_else(|| TunnelError::auth("session ended"))
    }

    /// Issue the stop-tunnel command, then delete the session. A rejected
    /// command leaves the session untouched.
    pub async fn stop(&self, session_id: &str, auth: &Authorization) -> Result<Session> {
        let session = self.known(session_id).await?;
        let command_id = self
            .backend
            .issue_command(
                session.node_id,
                CommandTopic::StopTunnel,
                &CommandParams::for_session(&session),
                auth,
            )
            .await?;
        info!(session_id, command_id, "Stop tunnel command issued");
        self.registry.set_stop_command(session_id, command_id).await;
        let ended = self.registry.delete(session_id).await.unwrap_or(session);
        Ok(Session {
            stop_command_id: Some(command_id),
            ..ended
        })
    }

    async fn known(&self, session_id: &str) -> Result<Session> {
        self.registry
            .find(session_id)
            .await
            .ok_or_else(|| TunnelError::auth("unknown session"))
    }

    /// Run the full workflow for an operator presenting `token_id`/`secret`.
    ///
    /// Resolves once the device has completed the start command (plus the
    /// grace period), or fails with the reason. Cancelling `cancel` abandons
    /// the wait; the device is still told to stop.
    pub async fn activate(
        &self,
        node_id: NodeId,
        token_id: &str,
        secret: &str,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        if self
            .actors
            .authenticate(node_id, token_id, secret)
            .await
            .is_none()
        {
            return Err(TunnelError::auth(format!(
                "token {token_id} not valid for node {node_id}"
            )));
        }
        let auth = Authorization::Token {
            token_id: token_id.to_string(),
            secret: secret.to_string(),
        };

        let session = self.create(node_id, &auth).await?;
        // Subscribe before the device can possibly connect
        let mut events = self.registry.subscribe();
        let session = self.start(&session.id, &auth).await?;
        let Some(command_id) = session.start_command_id else {
            return Err(TunnelError::comms("start command not recorded"));
        };

        if let Err(e) = self.await_completion(command_id, &auth, cancel).await {
            warn!(session_id = %session.id, node_id, "Activation failed: {e}");
            self.abandon(&session, &auth).await;
            return Err(e);
        }

        self.await_established(&session.id, &mut events).await;
        self.registry
            .find(&session.id)
            .await
            .ok_or_else(|| TunnelError::comms("session ended during activation"))
    }

    async fn await_completion(
        &self,
        command_id: CommandId,
        auth: &Authorization,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + self.wait_budget;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick is immediate
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Err(TunnelError::Timeout(command_id)),
                _ = ticker.tick() => {}
            }
            let state = tokio::select! {
                () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                state = self.backend.command_state(command_id, auth) => state?,
            };
            match state {
                CommandState::Completed => {
                    debug!(command_id, "Start command completed");
                    return Ok(());
                }
                CommandState::Declined => return Err(TunnelError::Declined(command_id)),
                state => debug!(command_id, ?state, "Waiting for start command"),
            }
        }
    }

    /// `Completed` means the device is dialling back, not that it has
    /// arrived. Give it up to `grace` to authenticate.
    async fn await_established(
        &self,
        session_id: &str,
        events: &mut broadcast::Receiver<RegistryEvent>,
    ) {
        if self
            .registry
            .find(session_id)
            .await
            .is_some_and(|s| s.established)
        {
            return;
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Established(id) | RegistryEvent::Ended(id))
                        if id == session_id =>
                    {
                        return
                    }
                    Err(RecvError::Closed) => return,
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(self.grace, wait).await.is_err() {
            debug!(session_id, "Device not yet established after grace period");
        }
    }

    /// Tell the device to tear down a tunnel that will not be used, then drop
    /// the session. Errors issuing the stop are only logged.
    async fn abandon(&self, session: &Session, auth: &Authorization) {
        match self
            .backend
            .issue_command(
                session.node_id,
                CommandTopic::StopTunnel,
                &CommandParams::for_session(session),
                auth,
            )
            .await
        {
            Ok(command_id) => {
                self.registry.set_stop_command(&session.id, command_id).await;
            }
            Err(e) => warn!(session_id = %session.id, "Compensating stop failed: {e}"),
        }
        self.registry.delete(&session.id).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::audit::NullAuditSink;
    use crate::backend::actors::StaticActorAuthenticator;
    use crate::backend::Command;
    use crate::config::ActorConfig;
    use crate::sessions::ports::PortAllocator;
    use crate::sessions::TransportLink;

    /// Scripted command backend: `command_state` pops from `states`, repeating
    /// `Queued` once the script runs out.
    #[derive(Default)]
    struct ScriptedBackend {
        states: Mutex<VecDeque<CommandState>>,
        polls: AtomicUsize,
        issued: Mutex<Vec<(CommandTopic, CommandParams)>>,
        fail_stop: bool,
    }

    impl ScriptedBackend {
        fn with_states(states: &[CommandState]) -> Self {
            Self {
                states: Mutex::new(states.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn topics(&self) -> Vec<CommandTopic> {
            self.issued.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    #[async_trait]
    impl CommandBackend for ScriptedBackend {
        async fn issue_command(
            &self,
            _node_id: NodeId,
            topic: CommandTopic,
            params: &CommandParams,
            _auth: &Authorization,
        ) -> Result<CommandId> {
            if self.fail_stop && topic == CommandTopic::StopTunnel {
                return Err(TunnelError::comms("backend down"));
            }
            let mut issued = self.issued.lock().unwrap();
            issued.push((topic, params.clone()));
            Ok(100 + issued.len() as i64)
        }

        async fn command_state(&self, _id: CommandId, _auth: &Authorization) -> Result<CommandState> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CommandState::Queued))
        }

        async fn pending_commands(
            &self,
            _node_id: NodeId,
            _auth: &Authorization,
        ) -> Result<Vec<Command>> {
            Ok(Vec::new())
        }

        async fn authorize_node(&self, _node_id: NodeId, _auth: &Authorization) -> Result<()> {
            Ok(())
        }
    }

    fn activator(backend: Arc<ScriptedBackend>, wait_secs: u64) -> Activator {
        let registry = SessionRegistry::new(
            PortAllocator::unprobed(50000, 50010),
            "ssh.example.net",
            8022,
            Arc::new(NullAuditSink),
        );
        let actors = StaticActorAuthenticator::new(vec![ActorConfig {
            node_id: 123,
            token_id: "tok".into(),
            secret: "s3cret".into(),
        }]);
        Activator::new(
            registry,
            backend,
            Arc::new(actors),
            &ActivationConfig {
                poll_interval_ms: 1000,
                wait_secs,
                grace_ms: 1000,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_on_third_poll() {
        use CommandState::*;
        let backend = Arc::new(ScriptedBackend::with_states(&[Queued, Executing, Completed]));
        let act = activator(backend.clone(), 300);
        let started = Instant::now();

        let session = act
            .activate(123, "tok", "s3cret", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(backend.topics(), vec![CommandTopic::StartTunnel]);
        assert_eq!(session.start_command_id, Some(101));
        assert!(act.registry().find(&session.id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_on_first_poll() {
        let backend = Arc::new(ScriptedBackend::with_states(&[CommandState::Declined]));
        let act = activator(backend.clone(), 300);

        let err = act
            .activate(123, "tok", "s3cret", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Declined(101)));
        assert_eq!(backend.polls.load(Ordering::SeqCst), 1);
        assert_eq!(
            backend.topics(),
            vec![CommandTopic::StartTunnel, CommandTopic::StopTunnel]
        );
        assert_eq!(act.registry().session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_times_out() {
        let backend = Arc::new(ScriptedBackend::default());
        let act = activator(backend.clone(), 5);

        let err = act
            .activate(123, "tok", "s3cret", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Timeout(_)));
        assert!(backend.polls.load(Ordering::SeqCst) >= 4);
        assert_eq!(backend.topics().last(), Some(&CommandTopic::StopTunnel));
        assert_eq!(act.registry().session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_issues_compensating_stop() {
        let backend = Arc::new(ScriptedBackend::default());
        let act = activator(backend.clone(), 300);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let err = act.activate(123, "tok", "s3cret", &cancel).await.unwrap_err();

        assert!(matches!(err, TunnelError::Cancelled));
        assert_eq!(backend.polls.load(Ordering::SeqCst), 2);
        assert_eq!(
            backend.topics(),
            vec![CommandTopic::StartTunnel, CommandTopic::StopTunnel]
        );
        assert_eq!(act.registry().session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_is_ignored() {
        let backend = Arc::new(ScriptedBackend {
            states: Mutex::new(VecDeque::from([CommandState::Declined])),
            fail_stop: true,
            ..ScriptedBackend::default()
        });
        let act = activator(backend.clone(), 300);

        let err = act
            .activate(123, "tok", "s3cret", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Declined(_)));
        assert_eq!(act.registry().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_bad_secret_issues_nothing() {
        let backend = Arc::new(ScriptedBackend::default());
        let act = activator(backend.clone(), 300);

        let err = act
            .activate(123, "tok", "wrong", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::AuthFailure(_)));
        assert!(backend.topics().is_empty());
        assert_eq!(act.registry().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_carries_reverse_port() {
        let backend = Arc::new(ScriptedBackend::default());
        let act = activator(backend.clone(), 300);
        let auth = Authorization::Presigned {
            authorization: "SNWS2 ...".into(),
            date: "Tue, 06 Oct 2026 10:00:00 GMT".into(),
        };

        let session = act.create(123, &auth).await.unwrap();
        let started = act.start(&session.id, &auth).await.unwrap();
        assert_eq!(started.start_command_id, Some(101));

        let issued = backend.issued.lock().unwrap();
        let (topic, params) = &issued[0];
        assert_eq!(*topic, CommandTopic::StartTunnel);
        assert_eq!(params.get("rport"), Some(session.reverse_ssh_port.to_string().as_str()));
        assert_eq!(params.get("user"), Some(session.id.as_str()));
        assert_eq!(params.get("host"), Some("ssh.example.net"));
        assert_eq!(params.get("port"), Some("8022"));
    }

    #[tokio::test]
    async fn test_stop_deletes_session() {
        let backend = Arc::new(ScriptedBackend::default());
        let act = activator(backend.clone(), 300);
        let auth = Authorization::Token {
            token_id: "tok".into(),
            secret: "s3cret".into(),
        };

        let session = act.create(123, &auth).await.unwrap();
        let stopped = act.stop(&session.id, &auth).await.unwrap();
        assert_eq!(stopped.id, session.id);
        assert_eq!(stopped.stop_command_id, Some(101));
        assert!(act.registry().find(&session.id).await.is_none());

        let err = act.stop(&session.id, &auth).await.unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn test_rejected_stop_keeps_session() {
        let backend = Arc::new(ScriptedBackend {
            fail_stop: true,
            ..ScriptedBackend::default()
        });
        let act = activator(backend.clone(), 300);
        let auth = Authorization::Token {
            token_id: "tok".into(),
            secret: "s3cret".into(),
        };

        let session = act.create(123, &auth).await.unwrap();
        assert!(act.stop(&session.id, &auth).await.is_err());
        let kept = act.registry().find(&session.id).await.unwrap();
        assert_eq!(kept.stop_command_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_established_device_skips_grace_wait() {
        let backend = Arc::new(ScriptedBackend::default());
        let act = activator(backend.clone(), 300);
        let auth = Authorization::Token {
            token_id: "tok".into(),
            secret: "s3cret".into(),
        };
        let session = act.create(123, &auth).await.unwrap();
        act.registry()
            .mark_established(&session.id, TransportLink::new(None, CancellationToken::new()))
            .await
            .unwrap();

        let mut events = act.registry().subscribe();
        let started = Instant::now();
        act.await_established(&session.id, &mut events).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
