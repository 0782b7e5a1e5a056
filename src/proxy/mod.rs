//! HTTP tunnel proxy: `/proxy/{sessionId}/<path>` to the device's web server.
//!
//! The upstream is always `http://{bind_host}:{reverseHttpPort}` of the named
//! session; nothing in the request picks the target. One [`SessionProxy`] is
//! built per session on first use and dropped when the session ends.

pub mod rewrite;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{self, header, HeaderValue},
    response::{IntoResponse, Response},
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::sessions::{RegistryEvent, Session, SessionRegistry};
use crate::state::AppState;
use rewrite::{split_proxy_path, strip_hop_by_hop, ProxyTarget};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type HttpClient = Client<HttpConnector, Body>;

/// Forwards requests for one session.
pub struct SessionProxy {
    target: ProxyTarget,
    client: HttpClient,
}

impl SessionProxy {
    pub fn new(session: &Session, bind_host: &str, client: HttpClient) -> Self {
        Self {
            target: ProxyTarget::new(&session.id, bind_host, session.reverse_http_port),
            client,
        }
    }

    pub async fn forward(&self, mut req: Request) -> Result<Response> {
        let own_origin = own_origin(&req);
        let upstream = self.target.upstream_uri(req.uri())?;
        debug!(%upstream, method = %req.method(), "Proxying request");
        *req.uri_mut() = upstream;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        if let Ok(host) = HeaderValue::from_str(self.target.authority()) {
            headers.insert(header::HOST, host);
        }
        if let Ok(path) = HeaderValue::from_str(self.target.forwarded_path()) {
            headers.insert("x-forwarded-path", path);
        }

        let response: http::Response<hyper::body::Incoming> = self
            .client
            .request(req)
            .await
            .map_err(|e| TunnelError::comms(format!("upstream request failed: {e}")))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        for name in [header::LOCATION, header::CONTENT_LOCATION] {
            let rewritten = parts
                .headers
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| self.target.rewrite_location(v, own_origin.as_deref()));
            if let Some(value) = rewritten.and_then(|v| HeaderValue::from_str(&v).ok()) {
                parts.headers.insert(name, value);
            }
        }
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// `scheme://host` the caller used, when the request says.
fn own_origin(req: &Request) -> Option<String> {
    let host = req.headers().get(header::HOST)?.to_str().ok()?;
    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{scheme}://{host}"))
}

/// Per-session proxies, built lazily.
#[derive(Clone)]
pub struct ProxyCache {
    proxies: Arc<RwLock<HashMap<String, Arc<SessionProxy>>>>,
    client: HttpClient,
    bind_host: String,
}

impl ProxyCache {
    pub fn new(bind_host: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            proxies: Arc::new(RwLock::new(HashMap::new())),
            client,
            bind_host: bind_host.into(),
        }
    }

    pub async fn get_or_create(&self, session: &Session) -> Arc<SessionProxy> {
        if let Some(proxy) = self.proxies.read().await.get(&session.id) {
            return Arc::clone(proxy);
        }
        let mut proxies = self.proxies.write().await;
        let proxy = proxies.entry(session.id.clone()).or_insert_with(|| {
            debug!(session_id = %session.id, port = session.reverse_http_port, "Creating session proxy");
            Arc::new(SessionProxy::new(session, &self.bind_host, self.client.clone()))
        });
        Arc::clone(proxy)
    }

    pub async fn evict(&self, session_id: &str) -> bool {
        self.proxies.write().await.remove(session_id).is_some()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.proxies.read().await.len()
    }

    /// Drop proxies of ended sessions until the registry goes away.
    pub fn spawn_evictor(&self, registry: &SessionRegistry) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Ended(id)) => {
                        if cache.evict(&id).await {
                            debug!(session_id = %id, "Session proxy dropped");
                        }
                    }
                    Ok(RegistryEvent::Established(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Proxy evictor lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Proxy evictor stopped");
        })
    }
}

/// `ANY /proxy/{sessionId}/**`
pub async fn proxy_request(State(state): State<AppState>, req: Request) -> Response {
    let Some(session_id) = split_proxy_path(req.uri().path()).map(|(id, _)| id.to_string()) else {
        return TunnelError::auth("unknown session").into_response();
    };
    let Some(session) = state.registry.find(&session_id).await else {
        return TunnelError::auth("unknown session").into_response();
    };
    let proxy = state.proxies.get_or_create(&session).await;
    match proxy.forward(req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(session_id = %session_id, "Proxy request failed: {e}");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use http_body_util::BodyExt;

    use super::*;

    fn session(port: u16) -> Session {
        Session {
            id: "S1".into(),
            created: 0,
            node_id: 1,
            ssh_host: "localhost".into(),
            ssh_port: 8022,
            reverse_ssh_port: port - 1,
            reverse_http_port: port,
            established: true,
            start_command_id: None,
            stop_command_id: None,
        }
    }

    /// Stand-in for the device web server: echoes path, query and the
    /// forwarded-path header, echoes POST bodies, and redirects `/go` back to
    /// its own origin.
    async fn upstream() -> SocketAddr {
        let app = Router::new().fallback(|req: Request| async move {
            if req.uri().path() == "/go" {
                let host = req
                    .headers()
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                return Response::builder()
                    .status(302)
                    .header(header::LOCATION, format!("http://{host}/done"))
                    .body(Body::empty())
                    .unwrap();
            }
            if req.method() == http::Method::POST {
                let uri = req.uri().clone();
                let body = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
                let line = format!("POST {uri} {}", String::from_utf8_lossy(&body));
                return Response::new(Body::from(line));
            }
            let fwd = req
                .headers()
                .get("x-forwarded-path")
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let line = format!("{} {fwd}", req.uri());
            Response::new(Body::from(line))
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_strips_prefix() {
        let addr = upstream().await;
        let cache = ProxyCache::new("127.0.0.1");
        let proxy = cache.get_or_create(&session(addr.port())).await;

        let req = Request::builder()
            .uri("/proxy/S1/status?x=1")
            .header(header::HOST, "relay.example.net")
            .body(Body::empty())
            .unwrap();
        let response = proxy.forward(req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/status?x=1 /proxy/S1");
    }

    #[tokio::test]
    async fn test_forward_preserves_request_body() {
        let addr = upstream().await;
        let cache = ProxyCache::new("127.0.0.1");
        let proxy = cache.get_or_create(&session(addr.port())).await;

        let req = Request::builder()
            .method("POST")
            .uri("/proxy/S1/api/settings")
            .header(header::HOST, "relay.example.net")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"wifi":"on"}"#))
            .unwrap();
        let response = proxy.forward(req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"POST /api/settings {"wifi":"on"}"#);
    }

    #[tokio::test]
    async fn test_forward_rewrites_redirect() {
        let addr = upstream().await;
        let cache = ProxyCache::new("127.0.0.1");
        let proxy = cache.get_or_create(&session(addr.port())).await;

        let req = Request::builder()
            .uri("/proxy/S1/go")
            .header(header::HOST, "relay.example.net")
            .body(Body::empty())
            .unwrap();
        let response = proxy.forward(req).await.unwrap();
        assert_eq!(response.status(), 302);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://relay.example.net/proxy/S1/done"
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_communication_failure() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let cache = ProxyCache::new("127.0.0.1");
        let proxy = cache.get_or_create(&session(port)).await;
        let req = Request::builder()
            .uri("/proxy/S1/")
            .body(Body::empty())
            .unwrap();
        let err = proxy.forward(req).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CommunicationFailure);
    }

    #[tokio::test]
    async fn test_cache_reuses_and_evicts() {
        let cache = ProxyCache::new("127.0.0.1");
        let s = session(50001);
        let a = cache.get_or_create(&s).await;
        let b = cache.get_or_create(&s).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 1);
        assert!(cache.evict("S1").await);
        assert!(!cache.evict("S1").await);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_evictor_follows_registry() {
        use crate::audit::NullAuditSink;
        use crate::sessions::ports::PortAllocator;

        let registry = SessionRegistry::new(
            PortAllocator::unprobed(50000, 50010),
            "localhost",
            8022,
            Arc::new(NullAuditSink),
        );
        let cache = ProxyCache::new("127.0.0.1");
        let _task = cache.spawn_evictor(&registry);
        let session = registry.create_session(1, &[]).await.unwrap();
        cache.get_or_create(&session).await;
        registry.delete(&session.id).await;

        for _ in 0..50 {
            if cache.len().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.len().await, 0);
    }
}
