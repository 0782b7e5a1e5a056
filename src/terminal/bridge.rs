//! Shell channel on the device, reached through its reverse SSH port.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::protocol::{AttachRequest, Utf8Decoder};
use crate::error::{Result, TunnelError};

/// Budget for connecting, logging in and starting the shell.
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the loopback hop to the device's own sshd.
pub struct DeviceClient;

impl client::Handler for DeviceClient {
    type Error = russh::Error;

    // Loopback hop into a tunnel the device opened itself
    async fn check_server_key(&mut self, _key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An open interactive shell on the device.
pub struct Shell {
    handle: Handle<DeviceClient>,
    channel: Channel<Msg>,
}

impl Shell {
    /// Log into `host:port` with the attach credentials and start a shell with
    /// the requested pty settings.
    pub async fn open(host: &str, port: u16, request: &AttachRequest) -> Result<Self> {
        Self::open_within(OPEN_TIMEOUT, host, port, request).await
    }

    async fn open_within(
        limit: Duration,
        host: &str,
        port: u16,
        request: &AttachRequest,
    ) -> Result<Self> {
        tokio::time::timeout(limit, Self::login(host, port, request))
            .await
            .map_err(|_| TunnelError::comms(format!("device shell did not open within {limit:?}")))?
    }

    async fn login(host: &str, port: u16, request: &AttachRequest) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (host, port), DeviceClient).await?;

        let password = request.password.as_deref().unwrap_or_default();
        let auth = handle
            .authenticate_password(request.username.as_str(), password)
            .await?;
        if !auth.success() {
            return Err(TunnelError::auth("device rejected the node credentials"));
        }

        let channel = handle.channel_open_session().await?;
        let term = &request.terminal;
        channel
            .request_pty(
                false,
                &term.term,
                term.cols,
                term.lines,
                term.width,
                term.height,
                &[],
            )
            .await?;
        for (name, value) in &term.environment {
            channel.set_env(false, name.as_str(), value.as_str()).await?;
        }
        channel.request_shell(false).await?;
        debug!(port, term = %term.term, cols = term.cols, lines = term.lines, "Shell opened");
        Ok(Self { handle, channel })
    }

    /// Pump text between the operator and the shell until either side closes
    /// or `close` fires.
    ///
    /// `inbound` yields operator input, written to the shell verbatim.
    /// Shell output, stderr included, goes to `outbound` as text.
    pub async fn run<I, O>(mut self, mut inbound: I, mut outbound: O, close: CancellationToken)
    where
        I: Stream<Item = String> + Unpin,
        O: Sink<String> + Unpin,
    {
        let mut decoder = Utf8Decoder::default();
        loop {
            tokio::select! {
                () = close.cancelled() => break,
                msg = self.channel.wait() => match msg {
                    Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                        let text = decoder.decode(&data);
                        if !text.is_empty() && outbound.send(text).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(exit_status, "Shell exited");
                    }
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                input = inbound.next() => match input {
                    Some(text) => {
                        if self.channel.data(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Shell closed");
        let _ = self.channel.close().await;
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        let _ = outbound.close().await;
    }
}
