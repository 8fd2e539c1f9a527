use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::http::{request::Parts, HeaderName, HeaderValue};

use super::{ForwardRequest, RouteMetadata};
use crate::error::ProxyError;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Binding from a path prefix to a cluster, with its cache policy.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub prefix: String,
    pub cluster: String,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
}

/// Maps an incoming request to a route and derives the outgoing request
/// shape. Matching is first-hit over the declared order, so more specific
/// prefixes must be declared before broader ones.
pub struct Director {
    routes: Vec<Route>,
}

impl Director {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn direct(
        &self,
        parts: &Parts,
        remote_addr: &str,
    ) -> Result<(ForwardRequest, RouteMetadata), ProxyError> {
        let path = parts.uri.path();
        let route = self
            .routes
            .iter()
            .find(|r| path.starts_with(&r.prefix))
            .ok_or_else(|| ProxyError::NoRoute(path.to_string()))?;

        let mut headers = parts.headers.clone();
        if let Some(client_ip) = client_ip_from_remote(remote_addr) {
            let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {client_ip}"),
                None => client_ip,
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(&X_FORWARDED_FOR, value);
            }
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let forward = ForwardRequest {
            method: parts.method.clone(),
            path_and_query,
            headers,
        };
        let metadata = RouteMetadata {
            route_name: route.name.clone(),
            cluster_name: route.cluster.clone(),
            cache_enabled: route.cache_enabled,
            cache_ttl: route.cache_ttl,
        };
        Ok((forward, metadata))
    }
}

/// Derive the client IP from a remote-address string. A scheme prefix is
/// stripped, a `host:port` form yields the host, and a bare address stands
/// for itself. Anything else yields nothing and the caller leaves
/// X-Forwarded-For untouched.
fn client_ip_from_remote(remote: &str) -> Option<String> {
    let rest = match remote.split_once("://") {
        Some((_, rest)) => rest,
        None => remote,
    };
    if rest.is_empty() {
        return None;
    }

    if let Ok(addr) = rest.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    if let Ok(ip) = rest.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    if !rest.contains(':') {
        return Some(rest.to_string());
    }

    match rest.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !host.contains(':')
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            Some(host.to_string())
        }
        _ => None,
    }
}
