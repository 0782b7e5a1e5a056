//! Browser terminal: WebSocket to an interactive shell on the device.
//!
//! `GET /ws/terminal?sessionId=<id>` upgrades only for a known session. The
//! first frame must be an `attach-ssh` control message (see [`protocol`]).
//! Its pre-signed authorization is checked against the command backend, its
//! username/password log into the device's own sshd through the session's
//! reverse SSH port. On success the server replies
//! `{"success":true,"message":"Ready to attach"}` and from then on every text
//! frame is shell input and every outbound frame is shell output.
//!
//! Attach failures close the socket with code 4000 and the reason.

pub mod bridge;
pub mod protocol;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{future, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::{AuditEvent, AuditKind};
use crate::error::{Result, TunnelError};
use crate::sessions::TransportLink;
use crate::state::AppState;
use bridge::Shell;
use protocol::{AttachReply, AttachRequest, ControlMessage, CLOSE_AUTH_FAILED};

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `GET /ws/terminal?sessionId=<id>`
pub async fn terminal_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session) = state.registry.find(&query.session_id).await else {
        return TunnelError::auth("unknown session").into_response();
    };
    let span = info_span!("terminal", session_id = %session.id, node_id = session.node_id);
    ws.on_upgrade(move |socket| handle_terminal(socket, state, session.id).instrument(span))
}

async fn handle_terminal(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sink, mut stream) = socket.split();

    let request = match read_attach(&mut stream).await {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            refuse(&mut sink, &e).await;
            return;
        }
        None => {
            debug!("Terminal closed before attaching");
            return;
        }
    };

    let shell = match open_shell(&state, &session_id, &request).await {
        Ok(shell) => shell,
        Err(e) => {
            refuse(&mut sink, &e).await;
            return;
        }
    };

    let reply = serde_json::to_string(&AttachReply::ready()).unwrap_or_default();
    if sink.send(Message::Text(reply.into())).await.is_err() {
        return;
    }

    // Deleting the session cancels the link and with it the shell
    let close = CancellationToken::new();
    let link = TransportLink::new(None, close.clone());
    let link_id = link.id;
    if !state.registry.attach_operator(&session_id, link).await {
        return;
    }
    audit(&state, AuditKind::OperatorConnected, &session_id).await;
    info!(user = %request.username, "Terminal attached");

    let inbound = stream
        .take_while(|frame| future::ready(!matches!(frame, Err(_) | Ok(Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                Ok(Message::Binary(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                _ => None,
            })
        });
    let outbound = sink.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });
    shell.run(Box::pin(inbound), Box::pin(outbound), close).await;

    state.registry.detach_operator(&session_id, link_id).await;
    audit(&state, AuditKind::OperatorDisconnected, &session_id).await;
    info!("Terminal detached");
}

/// Wait for the first data frame and decode it as `attach-ssh`. `None` when
/// the client goes away first.
async fn read_attach<S>(stream: &mut S) -> Option<Result<AttachRequest>>
where
    S: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return Some(ControlMessage::decode(text.as_str()).map(
                    |ControlMessage::AttachSsh(request)| request,
                ));
            }
            Ok(Message::Binary(_)) => {
                return Some(Err(TunnelError::auth("'attach-ssh' message not provided")));
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

async fn open_shell(state: &AppState, session_id: &str, request: &AttachRequest) -> Result<Shell> {
    let session = state
        .registry
        .find(session_id)
        .await
        .ok_or_else(|| TunnelError::auth("unknown session"))?;
    state
        .activator
        .backend()
        .authorize_node(session.node_id, &request.presigned()?)
        .await?;
    if !session.established {
        return Err(TunnelError::comms("device is not connected"));
    }
    Shell::open(
        &state.config.sessions.bind_host,
        session.reverse_ssh_port,
        request,
    )
    .await
}

async fn refuse<S>(sink: &mut S, err: &TunnelError)
where
    S: futures::Sink<Message> + Unpin,
{
    warn!("Terminal attach refused: {err}");
    let frame = CloseFrame {
        code: CLOSE_AUTH_FAILED,
        reason: err.public_message().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

async fn audit(state: &AppState, kind: AuditKind, session_id: &str) {
    let event = match state.registry.find(session_id).await {
        Some(session) => AuditEvent::for_session(kind, &session).rport(session.reverse_ssh_port),
        None => AuditEvent::for_identity(kind, session_id),
    };
    state.audit.record(event);
}
