//! URL mapping between `/proxy/{sessionId}/...` and the device's HTTP port.

use axum::http::{header, HeaderMap, HeaderName, Uri};

use crate::error::{Result, TunnelError};

pub const PROXY_ROOT: &str = "/proxy/";

/// Split `/proxy/{id}/rest` into `("id", "/rest")`. The rest may be empty.
pub fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let tail = path.strip_prefix(PROXY_ROOT)?;
    let (id, rest) = match tail.find('/') {
        Some(i) => tail.split_at(i),
        None => (tail, ""),
    };
    (!id.is_empty()).then_some((id, rest))
}

/// Where one session's proxied requests go.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    /// `/proxy/{id}`, no trailing slash.
    prefix: String,
    /// `host:port` of the reverse HTTP port.
    authority: String,
}

impl ProxyTarget {
    pub fn new(session_id: &str, host: &str, port: u16) -> Self {
        Self {
            prefix: format!("{PROXY_ROOT}{session_id}"),
            authority: format!("{host}:{port}"),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Value of the `X-Forwarded-Path` header sent upstream.
    pub fn forwarded_path(&self) -> &str {
        &self.prefix
    }

    /// Upstream URI for an inbound request URI: prefix stripped, query kept.
    pub fn upstream_uri(&self, inbound: &Uri) -> Result<Uri> {
        let rest = inbound
            .path()
            .strip_prefix(&self.prefix)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(|| TunnelError::auth("request is not for this session"))?;
        let path = if rest.is_empty() { "/" } else { rest };
        let uri = match inbound.query() {
            Some(q) => format!("http://{}{path}?{q}", self.authority),
            None => format!("http://{}{path}", self.authority),
        };
        uri.parse()
            .map_err(|e| TunnelError::comms(format!("invalid upstream URI: {e}")))
    }

    /// Rewrite a redirect from the device so the browser stays on the proxy.
    ///
    /// URLs on the device's own origin, or on `own_origin` (`scheme://host` of
    /// the inbound request), and absolute paths are re-rooted under the
    /// session prefix. Foreign and relative URLs come back `None`.
    pub fn rewrite_location(&self, location: &str, own_origin: Option<&str>) -> Option<String> {
        if location.starts_with("//") {
            return None;
        }
        let uri: Uri = location.parse().ok()?;
        match (uri.scheme(), uri.authority()) {
            (Some(_), Some(authority)) => {
                let ours = own_origin
                    .and_then(|o| o.parse::<Uri>().ok())
                    .is_some_and(|own| same_origin(&own, &uri));
                if !ours && !authority.as_str().eq_ignore_ascii_case(&self.authority) {
                    return None;
                }
            }
            (None, None) if location.starts_with('/') => {}
            _ => return None,
        }

        let path = uri.path();
        let mut out = own_origin.unwrap_or_default().to_string();
        let already = path == self.prefix || path.starts_with(&format!("{}/", self.prefix));
        if !already {
            out.push_str(&self.prefix);
        }
        out.push_str(path);
        if let Some(query) = uri.query() {
            out.push('?');
            out.push_str(query);
        }
        Some(out)
    }
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    let scheme = |u: &Uri| u.scheme_str().map(str::to_ascii_lowercase);
    let authority = |u: &Uri| u.authority().map(|a| a.as_str().to_ascii_lowercase());
    scheme(a).is_some() && scheme(a) == scheme(b) && authority(a) == authority(b)
}

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
