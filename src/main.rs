#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # dialback
//!
//! Reverse SSH tunnel relay for devices behind NAT.
//!
//! A device cannot be dialled directly, so dialback asks it (through the
//! command backend) to dial back: it reserves a pair of loopback ports,
//! issues a start-tunnel command naming them, and waits for the device to
//! log into the device SSH endpoint and forward its sshd and web server onto
//! those ports. Operators then reach the device through the operator SSH
//! endpoint, the browser terminal or the HTTP proxy.
//!
//! ## Subcommands
//!
//! - `dialback serve` (default): run the HTTP server and SSH endpoints
//! - `dialback check-config`: print the effective configuration and exit
//!
//! ## Listeners
//!
//! | Config key          | Protocol | Who                               |
//! |---------------------|----------|-----------------------------------|
//! | `server.listen`     | HTTP/WS  | Session API, terminal, proxy      |
//! | `ssh.listen`        | SSH      | Devices dialling back             |
//! | `ssh.direct_listen` | SSH      | Operators (`nodeId:tokenId` login)|

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use russh::MethodKind;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dialback::audit::{NullAuditSink, SharedAuditSink, TracingAuditSink};
use dialback::backend::actors::StaticActorAuthenticator;
use dialback::backend::solarnet::HttpCommandBackend;
use dialback::config::Config;
use dialback::ssh::bridge::SessionBridge;
use dialback::ssh::deny::InMemoryDenyList;
use dialback::ssh::device::DeviceHandler;
use dialback::ssh::operator::OperatorHandler;
use dialback::ssh::{self, Endpoint, Role};
use dialback::{routes, AppState, SessionRegistry};

/// Reverse SSH tunnel relay.
#[derive(Parser)]
#[command(name = "dialback", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the effective configuration as TOML and exit.
    CheckConfig {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig { config }) => check_config(config.as_deref()),
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn check_config(config_path: Option<&str>) {
    let config = Config::load(config_path);
    match toml::to_string_pretty(&config) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("dialback v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Reverse ports {}..{} on {}",
        config.sessions.reverse_port_min, config.sessions.reverse_port_max, config.sessions.bind_host
    );
    if config.actors.is_empty() && config.ssh.direct_listen.is_some() {
        warn!("Operator SSH endpoint enabled but no [[actors]] configured, every login will fail");
    }

    let audit: SharedAuditSink = if config.logging.audit {
        Arc::new(TracingAuditSink)
    } else {
        Arc::new(NullAuditSink)
    };
    let registry = SessionRegistry::from_config(&config, Arc::clone(&audit));
    let backend = HttpCommandBackend::new(&config.backend).expect("Failed to build backend client");
    let actors = StaticActorAuthenticator::new(config.actors.clone());
    let state = AppState::new(
        config,
        registry.clone(),
        Arc::new(backend),
        Arc::new(actors),
        Arc::clone(&audit),
    );
    let config = Arc::clone(&state.config);

    let (events, bridge_task) = SessionBridge::new(registry.clone(), Arc::clone(&audit)).spawn();
    let proxy_evictor = state.proxies.spawn_evictor(&registry);
    let shutdown = CancellationToken::new();

    let host_key = ssh::load_host_key(&config.ssh).expect("Failed to load SSH host key");
    let endpoint = Endpoint {
        registry: registry.clone(),
        events: events.clone(),
        deny: Arc::new(InMemoryDenyList::new(&config.deny_list)),
        bind_host: config.sessions.bind_host.clone(),
        tasks: TaskTracker::new(),
    };
    let activations = endpoint.tasks.clone();

    // Device endpoint
    let device_listener = TcpListener::bind(&config.ssh.listen)
        .await
        .expect("Failed to bind device SSH endpoint");
    let device_task = {
        let endpoint = endpoint.clone();
        tokio::spawn(ssh::serve(
            device_listener,
            ssh::server_config(host_key.clone(), &[MethodKind::PublicKey]),
            Role::Device,
            events.clone(),
            shutdown.clone(),
            move |remote, close, login| DeviceHandler::new(endpoint.clone(), remote, close, login),
        ))
    };

    // Operator endpoint, when configured
    let operator_task = match &config.ssh.direct_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .expect("Failed to bind operator SSH endpoint");
            let endpoint = endpoint.clone();
            let activator = Arc::clone(&state.activator);
            let auth_timeout = Duration::from_secs(config.ssh.auth_timeout_secs);
            Some(tokio::spawn(ssh::serve(
                listener,
                ssh::server_config(host_key, &[MethodKind::Password]),
                Role::Operator,
                events.clone(),
                shutdown.clone(),
                move |remote, close, login| {
                    OperatorHandler::new(
                        endpoint.clone(),
                        Arc::clone(&activator),
                        auth_timeout,
                        remote,
                        close,
                        login,
                    )
                },
            )))
        }
        None => None,
    };
    drop(events);
    drop(endpoint);

    // Periodic sweep: drop sessions the device never connected to
    let reaper = registry.clone();
    let expire = Duration::from_secs(config.sessions.expire_secs);
    let reap_every = Duration::from_secs(config.sessions.expire_interval_secs.max(1));
    let reaper_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_every);
        loop {
            interval.tick().await;
            let expired = reaper.reap_expired(expire).await;
            if !expired.is_empty() {
                info!("Expired {} unestablished session(s)", expired.len());
            }
        }
    });

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind HTTP listener");
    info!("HTTP listening on {}", config.server.listen);

    let app = routes::router(state.clone());

    // Graceful shutdown
    let signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
    {
        error!("HTTP server error: {e}");
    }

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    reaper_task.abort();
    let _ = device_task.await;
    if let Some(task) = operator_task {
        let _ = task.await;
    }
    // Cancelled activations still owe the device a stop command
    activations.close();
    if tokio::time::timeout(Duration::from_secs(10), activations.wait())
        .await
        .is_err()
    {
        warn!("{} activation(s) still running at shutdown", activations.len());
    }
    registry.delete_all().await;
    proxy_evictor.abort();
    drop(state);
    // Remaining handlers drop their senders as their connections wind down
    if tokio::time::timeout(Duration::from_secs(5), bridge_task).await.is_err() {
        warn!("Session bridge did not drain in time");
    }
    info!("Goodbye");
}
