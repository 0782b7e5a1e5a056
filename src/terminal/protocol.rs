//! Terminal WebSocket message types.
//!
//! The first text frame on a terminal socket must be a control message:
//!
//! ```json
//! {"cmd": "attach-ssh", "data": {
//!     "authorization": "SNWS2 Credential=...",
//!     "authorization-date": 1700000000000,
//!     "username": "solar",
//!     "password": "...",
//!     "term": "xterm", "cols": 120, "lines": 40
//! }}
//! ```
//!
//! Every frame after a successful attach is raw terminal input.

use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::backend::Authorization;
use crate::error::TunnelError;

/// Control messages accepted before the terminal is attached.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum ControlMessage {
    #[serde(rename = "attach-ssh")]
    AttachSsh(AttachRequest),
}

impl ControlMessage {
    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(text)
            .map_err(|e| TunnelError::auth(format!("'attach-ssh' message not provided: {e}")))
    }
}

#[derive(Clone, Deserialize)]
pub struct AttachRequest {
    /// Pre-signed authorization for the node, produced by the browser.
    pub authorization: String,
    /// Signing date of `authorization`, epoch milliseconds.
    #[serde(rename = "authorization-date")]
    pub authorization_date: i64,
    /// Login on the device's own SSH daemon.
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub terminal: TerminalSettings,
}

impl fmt::Debug for AttachRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRequest")
            .field("authorization_date", &self.authorization_date)
            .field("username", &self.username)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

impl AttachRequest {
    /// The pre-signed authorization in the form the command backend replays.
    pub fn presigned(&self) -> Result<Authorization, TunnelError> {
        let date = http_date(self.authorization_date)
            .ok_or_else(|| TunnelError::auth("invalid authorization-date"))?;
        Ok(Authorization::Presigned {
            authorization: self.authorization.clone(),
            date,
        })
    }
}

/// Pty parameters applied once when the shell channel opens.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSettings {
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_lines")]
    pub lines: u32,
    /// Pixel width; 0 when unknown.
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_term() -> String {
    "xterm".to_string()
}
fn default_cols() -> u32 {
    80
}
fn default_lines() -> u32 {
    24
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            term: default_term(),
            cols: default_cols(),
            lines: default_lines(),
            width: 0,
            height: 0,
            environment: BTreeMap::new(),
        }
    }
}

/// Reply to a successful attach.
#[derive(Debug, Serialize)]
pub struct AttachReply {
    pub success: bool,
    pub message: &'static str,
}

impl AttachReply {
    pub fn ready() -> Self {
        Self {
            success: true,
            message: "Ready to attach",
        }
    }
}

/// WebSocket close code sent when attaching fails.
pub const CLOSE_AUTH_FAILED: u16 = 4000;

/// RFC 7231 date for epoch milliseconds.
fn http_date(epoch_ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(epoch_ms)
        .map(|d| d.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

/// Turns shell output chunks into text, holding back a multi-byte sequence
/// split across chunks until the rest arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }
}
