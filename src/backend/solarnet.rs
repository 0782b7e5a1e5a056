//! HTTP client for the instruction control plane.
//!
//! [`HttpCommandBackend`] wraps `reqwest::Client`. Every call forwards the
//! caller's [`Authorization`]: pre-signed requests are replayed with their
//! `Authorization` and `X-SN-Date` headers, actor tokens go out as HTTP basic
//! credentials.
//!
//! ## Endpoints
//!
//! | Call                 | Request                                         |
//! |----------------------|-------------------------------------------------|
//! | `issue_command`      | `POST /solaruser/api/v1/sec/instr/add` (form)   |
//! | `command_state`      | `GET /solaruser/api/v1/sec/instr/view?id=`      |
//! | `pending_commands`   | `GET /solaruser/api/v1/sec/instr/viewPending?nodeId=` |
//! | `authorize_node`     | `GET /solaruser/api/v1/sec/nodes/meta/{nodeId}` |
//!
//! Responses are `{"success": bool, "data": ..., "message": ...}`. 401/403
//! map to [`TunnelError::AuthFailure`]; anything else that is not a success
//! is a [`TunnelError::CommunicationFailure`].

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{
    Authorization, Command, CommandBackend, CommandId, CommandParams, CommandState, CommandTopic,
    NodeId,
};
use crate::config::BackendConfig;
use crate::error::{Result, TunnelError};

const API_PREFIX: &str = "/solaruser/api/v1/sec";

/// Envelope of every control-plane response.
#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

pub struct HttpCommandBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCommandBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        // Strip trailing slash for consistent URL construction
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    fn authorize(builder: reqwest::RequestBuilder, auth: &Authorization) -> reqwest::RequestBuilder {
        match auth {
            Authorization::Presigned {
                authorization,
                date,
            } => builder
                .header(reqwest::header::AUTHORIZATION, authorization)
                .header("X-SN-Date", date),
            Authorization::Token { token_id, secret } => builder.basic_auth(token_id, Some(secret)),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let resp = request.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TunnelError::auth(format!("control plane rejected request ({status})")));
        }
        if !status.is_success() {
            return Err(TunnelError::comms(format!("control plane returned {status}")));
        }
        let body: ApiResponse<T> = resp.json().await?;
        if !body.success {
            return Err(TunnelError::comms(
                body.message
                    .unwrap_or_else(|| "control plane reported failure".to_string()),
            ));
        }
        body.data
            .ok_or_else(|| TunnelError::comms("control plane response missing data"))
    }
}

#[async_trait]
impl CommandBackend for HttpCommandBackend {
    async fn issue_command(
        &self,
        node_id: NodeId,
        topic: CommandTopic,
        params: &CommandParams,
        auth: &Authorization,
    ) -> Result<CommandId> {
        let mut form = vec![
            ("nodeId".to_string(), node_id.to_string()),
            ("topic".to_string(), topic.as_str().to_string()),
        ];
        form.extend(params.encode());
        debug!(node_id, topic = topic.as_str(), "Queueing command");
        let request = Self::authorize(self.http.post(self.url("/instr/add")), auth).form(&form);
        let command: Command = self.send(request).await?;
        Ok(command.id)
    }

    async fn command_state(&self, id: CommandId, auth: &Authorization) -> Result<CommandState> {
        let request = Self::authorize(
            self.http
                .get(self.url("/instr/view"))
                .query(&[("id", id.to_string())]),
            auth,
        );
        let command: Command = self.send(request).await?;
        Ok(command.state)
    }

    async fn pending_commands(
        &self,
        node_id: NodeId,
        auth: &Authorization,
    ) -> Result<Vec<Command>> {
        let request = Self::authorize(
            self.http
                .get(self.url("/instr/viewPending"))
                .query(&[("nodeId", node_id.to_string())]),
            auth,
        );
        self.send(request).await
    }

    async fn authorize_node(&self, node_id: NodeId, auth: &Authorization) -> Result<()> {
        let request = Self::authorize(self.http.get(self.url(&format!("/nodes/meta/{node_id}"))), auth);
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }
}
