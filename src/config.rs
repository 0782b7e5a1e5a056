//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DIALBACK_LISTEN`, `DIALBACK_SSH_HOST`,
//!    `DIALBACK_BACKEND_URL`
//! 2. **Config file**: path via `--config <path>`, or `dialback.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [ssh]
//! host = "ssh.example.net"          # advertised to devices
//! port = 8022                       # advertised to devices
//! listen = "0.0.0.0:8022"           # device-facing endpoint
//! direct_listen = "0.0.0.0:9022"    # operator endpoint, omit to disable
//! host_key_path = "/etc/dialback/ssh_host_ed25519_key"
//!
//! [sessions]
//! reverse_port_min = 50000
//! reverse_port_max = 65000
//! expire_secs = 300
//!
//! [activation]
//! poll_interval_ms = 1000
//! wait_secs = 300
//!
//! [backend]
//! base_url = "https://data.example.net"
//!
//! [[actors]]
//! node_id = 123
//! token_id = "abc"
//! secret = "shh"
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Static actor tokens accepted by the operator SSH endpoint.
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
    #[serde(default)]
    pub deny_list: DenyListConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// SSH endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    /// Host name devices are told to dial back to. Override with `DIALBACK_SSH_HOST`.
    #[serde(default = "default_ssh_host")]
    pub host: String,
    /// Port devices are told to dial back to (default 8022).
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Bind address of the device-facing endpoint (default `0.0.0.0:8022`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// Bind address of the operator endpoint. `None` disables it.
    #[serde(default)]
    pub direct_listen: Option<String>,
    /// OpenSSH private host key. A fresh Ed25519 key is generated when unset.
    #[serde(default)]
    pub host_key_path: Option<String>,
    #[serde(default)]
    pub host_key_password: Option<String>,
    /// Seconds an operator connection may spend authenticating, which includes
    /// the whole activation wait (default 300).
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

/// Session registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionsConfig {
    /// First reverse SSH port handed out (inclusive, default 50000).
    #[serde(default = "default_reverse_port_min")]
    pub reverse_port_min: u16,
    /// Upper bound of the reverse port range (exclusive, default 65000).
    #[serde(default = "default_reverse_port_max")]
    pub reverse_port_max: u16,
    /// Host reverse ports are probed and bound on (default `127.0.0.1`).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Seconds an unestablished session survives (default 300).
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,
    /// Seconds between expiry sweeps (default 60).
    #[serde(default = "default_expire_interval_secs")]
    pub expire_interval_secs: u64,
}

/// Remote activation timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActivationConfig {
    /// Command state poll interval in milliseconds (default 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Total seconds to wait for the device to complete the command (default 300).
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    /// Milliseconds granted after `Completed` for the device to finish
    /// connecting back (default 1000).
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

/// Command backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL of the control plane. Override with `DIALBACK_BACKEND_URL`.
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

/// One static actor token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActorConfig {
    pub node_id: i64,
    pub token_id: String,
    #[serde(skip_serializing)]
    pub secret: String,
}

/// Brute-force protection for the SSH endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DenyListConfig {
    /// Failed authentications before an address is blocked (default 5).
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Seconds a blocked address stays blocked (default 600).
    #[serde(default = "default_ban_secs")]
    pub ban_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit audit records (default true).
    #[serde(default = "default_audit")]
    pub audit: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ssh_host() -> String {
    "localhost".to_string()
}
fn default_ssh_port() -> u16 {
    8022
}
fn default_ssh_listen() -> String {
    "0.0.0.0:8022".to_string()
}
fn default_auth_timeout_secs() -> u64 {
    300
}
fn default_reverse_port_min() -> u16 {
    50000
}
fn default_reverse_port_max() -> u16 {
    65000
}
fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_expire_secs() -> u64 {
    300
}
fn default_expire_interval_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_wait_secs() -> u64 {
    300
}
fn default_grace_ms() -> u64 {
    1000
}
fn default_backend_url() -> String {
    "https://data.solarnetwork.net".to_string()
}
fn default_backend_timeout_secs() -> u64 {
    30
}
fn default_max_failures() -> u32 {
    5
}
fn default_ban_secs() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_audit() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: default_ssh_host(),
            port: default_ssh_port(),
            listen: default_ssh_listen(),
            direct_listen: None,
            host_key_path: None,
            host_key_password: None,
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            reverse_port_min: default_reverse_port_min(),
            reverse_port_max: default_reverse_port_max(),
            bind_host: default_bind_host(),
            expire_secs: default_expire_secs(),
            expire_interval_secs: default_expire_interval_secs(),
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_secs: default_wait_secs(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            timeout_secs: default_backend_timeout_secs(),
        }
    }
}

impl Default for DenyListConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            ban_secs: default_ban_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit: default_audit(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `dialback.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content).unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("dialback.toml").exists() {
            let content =
                std::fs::read_to_string("dialback.toml").expect("Failed to read dialback.toml");
            Self::parse(&content).expect("Failed to parse dialback.toml")
        } else {
            Config::default()
        };

        if let Ok(listen) = std::env::var("DIALBACK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(host) = std::env::var("DIALBACK_SSH_HOST") {
            config.ssh.host = host;
        }
        if let Ok(url) = std::env::var("DIALBACK_BACKEND_URL") {
            config.backend.base_url = url;
        }

        config
    }

    /// Parse a TOML document, applying defaults for missing fields.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.ssh.port, 8022);
        assert_eq!(config.sessions.reverse_port_min, 50000);
        assert_eq!(config.sessions.reverse_port_max, 65000);
        assert_eq!(config.sessions.expire_secs, 300);
        assert_eq!(config.activation.poll_interval_ms, 1000);
        assert_eq!(config.activation.wait_secs, 300);
        assert!(config.ssh.direct_listen.is_none());
        assert!(config.actors.is_empty());
    }

    #[test]
    fn test_partial_sections_and_actors() {
        let config = Config::parse(
            r#"
            [ssh]
            host = "ssh.example.net"
            direct_listen = "0.0.0.0:9022"

            [sessions]
            reverse_port_min = 40000

            [[actors]]
            node_id = 42
            token_id = "tok"
            secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.ssh.host, "ssh.example.net");
        assert_eq!(config.ssh.port, 8022);
        assert_eq!(config.ssh.direct_listen.as_deref(), Some("0.0.0.0:9022"));
        assert_eq!(config.sessions.reverse_port_min, 40000);
        assert_eq!(config.sessions.reverse_port_max, 65000);
        assert_eq!(config.actors.len(), 1);
        assert_eq!(config.actors[0].node_id, 42);
    }
}
