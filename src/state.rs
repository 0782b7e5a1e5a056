//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::activation::Activator;
use crate::audit::SharedAuditSink;
use crate::backend::{ActorAuthenticator, CommandBackend};
use crate::config::Config;
use crate::proxy::ProxyCache;
use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub registry: SessionRegistry,
    pub activator: Arc<Activator>,
    /// Per-session HTTP proxies.
    pub proxies: ProxyCache,
    pub audit: SharedAuditSink,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: SessionRegistry,
        backend: Arc<dyn CommandBackend>,
        actors: Arc<dyn ActorAuthenticator>,
        audit: SharedAuditSink,
    ) -> Self {
        let activator = Activator::new(registry.clone(), backend, actors, &config.activation);
        let proxies = ProxyCache::new(config.sessions.bind_host.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            activator: Arc::new(activator),
            proxies,
            audit,
        }
    }
}
