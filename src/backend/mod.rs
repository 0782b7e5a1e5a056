//! External collaborators: the command (instruction) control plane and actor
//! authentication.
//!
//! The core only depends on the two traits here. [`solarnet::HttpCommandBackend`]
//! talks to the real control plane over HTTPS; [`actors::StaticActorAuthenticator`]
//! checks tokens listed in the configuration.

pub mod actors;
pub mod solarnet;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sessions::Session;

pub type NodeId = i64;
pub type CommandId = i64;

/// Lifecycle of a command on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    Queuing,
    Queued,
    Received,
    Executing,
    Declined,
    Completed,
    #[serde(other)]
    Unknown,
}

impl CommandState {
    /// Still on its way to (or being handled by) the device.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Queuing | Self::Queued | Self::Received | Self::Executing
        )
    }
}

/// What a command asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTopic {
    StartTunnel,
    StopTunnel,
}

impl CommandTopic {
    /// Topic name understood by the device-side agent.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartTunnel => "StartRemoteSsh",
            Self::StopTunnel => "StopRemoteSsh",
        }
    }
}

/// A command as reported by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub node_id: NodeId,
    pub topic: String,
    pub state: CommandState,
}

impl Command {
    pub fn is_topic(&self, topic: CommandTopic) -> bool {
        self.topic == topic.as_str()
    }
}

/// Credentials the control plane accepts on behalf of a caller.
#[derive(Clone)]
pub enum Authorization {
    /// A request pre-signed by the browser client, replayed verbatim.
    Presigned { authorization: String, date: String },
    /// An actor token, used when the caller authenticated with a token secret.
    Token { token_id: String, secret: String },
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presigned { date, .. } => f
                .debug_struct("Presigned")
                .field("date", date)
                .finish_non_exhaustive(),
            Self::Token { token_id, .. } => f
                .debug_struct("Token")
                .field("token_id", token_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Ordered name/value command parameters.
///
/// On the wire they become an indexed list: `parameters[0].name=host`,
/// `parameters[0].value=...`, `parameters[1].name=user`, and so on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandParams(Vec<(String, String)>);

impl CommandParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.0.push((name.to_string(), value.to_string()));
        self
    }

    /// Tunnel parameters for `session`: where to dial, as whom, and which
    /// reverse port to request.
    pub fn for_session(session: &Session) -> Self {
        Self::new()
            .with("host", &session.ssh_host)
            .with("user", &session.id)
            .with("port", session.ssh_port)
            .with("rport", session.reverse_ssh_port)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Indexed form fields.
    pub fn encode(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(self.0.len() * 2);
        for (i, (name, value)) in self.0.iter().enumerate() {
            fields.push((format!("parameters[{i}].name"), name.clone()));
            fields.push((format!("parameters[{i}].value"), value.clone()));
        }
        fields
    }
}

/// The remote command/instruction service.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Queue `topic` for `node_id`. Returns the new command's ID.
    async fn issue_command(
        &self,
        node_id: NodeId,
        topic: CommandTopic,
        params: &CommandParams,
        auth: &Authorization,
    ) -> Result<CommandId>;

    async fn command_state(&self, id: CommandId, auth: &Authorization) -> Result<CommandState>;

    /// Commands for `node_id` that have not reached a final state.
    async fn pending_commands(&self, node_id: NodeId, auth: &Authorization)
        -> Result<Vec<Command>>;

    /// Succeeds if `auth` grants access to `node_id`.
    async fn authorize_node(&self, node_id: NodeId, auth: &Authorization) -> Result<()>;
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub node_id: NodeId,
    pub token_id: String,
}

#[async_trait]
pub trait ActorAuthenticator: Send + Sync {
    async fn authenticate(&self, node_id: NodeId, token_id: &str, secret: &str) -> Option<Actor>;
}
