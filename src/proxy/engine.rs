use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, info, warn};
use url::Url;

use super::stream::{CacheWrite, RelayBody, RequestOutcome};
use super::Director;
use crate::cache::ResponseCache;
use crate::cluster::Cluster;
use crate::error::ProxyError;
use crate::observability::metrics;

/// Request-pipeline orchestrator: director, endpoint selection, cache lookup,
/// upstream round trip, response streaming, opportunistic cache insert.
pub struct Engine {
    director: Director,
    clusters: HashMap<String, Arc<Cluster>>,
    cache: Arc<ResponseCache>,
    client: reqwest::Client,
    max_cache_body: usize,
}

impl Engine {
    pub fn new(
        director: Director,
        clusters: HashMap<String, Arc<Cluster>>,
        cache: Arc<ResponseCache>,
        client: reqwest::Client,
        max_cache_body: i64,
    ) -> Self {
        Self {
            director,
            clusters,
            cache,
            client,
            max_cache_body: max_cache_body.max(0) as usize,
        }
    }

    pub async fn handle(&self, remote: Option<SocketAddr>, req: Request) -> Response {
        let started = Instant::now();
        let (parts, body) = req.into_parts();
        let inbound_method = parts.method.clone();
        let inbound_path = parts.uri.path().to_string();
        let remote_addr = remote.map(|a| a.to_string()).unwrap_or_default();

        let (forward, metadata) = match self.director.direct(&parts, &remote_addr) {
            Ok(directed) => directed,
            Err(err) => {
                error!(method = %inbound_method, path = %inbound_path, error = %err, "director error");
                metrics::observe_request("", inbound_method.as_str(), 502, started.elapsed());
                return err.into_response();
            }
        };
        let route_label = metadata.cluster_name.clone();

        let cluster = match self.clusters.get(&metadata.cluster_name) {
            Some(cluster) => cluster.clone(),
            None => {
                let err = ProxyError::UnknownCluster(metadata.cluster_name.clone());
                error!(method = %inbound_method, path = %inbound_path, error = %err, "cluster lookup failed");
                metrics::observe_request(&route_label, inbound_method.as_str(), 502, started.elapsed());
                return err.into_response();
            }
        };

        let picked = match cluster.pick_endpoint() {
            Ok(picked) => picked,
            Err(err) => {
                warn!(method = %inbound_method, path = %inbound_path, error = %err, "endpoint selection failed");
                metrics::observe_request(&route_label, inbound_method.as_str(), 502, started.elapsed());
                return err.into_response();
            }
        };

        let target = format!(
            "{}://{}{}",
            picked.url.scheme(),
            host_with_port(&picked.url),
            forward.path_and_query
        );
        let cacheable_method = forward.method == Method::GET || forward.method == Method::HEAD;
        let key = cache_key(&forward.method, &target);

        if metadata.cache_enabled && cacheable_method {
            if let Some(response) =
                self.serve_from_cache(&key, &route_label, &inbound_method, &inbound_path, started)
            {
                return response;
            }
        }

        let mut out_headers = end_to_end_headers(&forward.headers);
        out_headers.remove(header::HOST);

        let has_body = forward.headers.contains_key(header::CONTENT_LENGTH)
            || forward.headers.contains_key(header::TRANSFER_ENCODING);
        let mut builder = self
            .client
            .request(forward.method.clone(), &target)
            .headers(out_headers);
        if has_body {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream_response = builder.send().await;

        let upstream_response = match upstream_response {
            Ok(response) => {
                cluster.report_success(picked.index);
                response
            }
            Err(err) => {
                cluster.report_failure(picked.index);
                error!(method = %forward.method, url = %target, error = %err, "upstream error");
                metrics::observe_request(&route_label, inbound_method.as_str(), 502, started.elapsed());
                return ProxyError::Upstream(err.to_string()).into_response();
            }
        };

        let status = upstream_response.status();
        let response_headers = end_to_end_headers(upstream_response.headers());

        let mut cache_write = None;
        if metadata.cache_enabled
            && cacheable_method
            && is_cacheable_response(status, upstream_response.headers())
        {
            if let Some(ttl) = cache_ttl(upstream_response.headers(), metadata.cache_ttl) {
                cache_write = Some(CacheWrite::new(
                    self.cache.clone(),
                    key,
                    status,
                    response_headers.clone(),
                    ttl,
                    self.max_cache_body,
                ));
            }
        }

        let outcome = RequestOutcome {
            route: route_label,
            method: inbound_method.to_string(),
            path: inbound_path,
            status: status.as_u16(),
            cache_enabled: metadata.cache_enabled,
            started,
        };
        let relay = RelayBody::new(upstream_response.bytes_stream(), cache_write, outcome);

        let mut response = Response::new(Body::from_stream(relay));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    fn serve_from_cache(
        &self,
        key: &str,
        route_label: &str,
        method: &Method,
        path: &str,
        started: Instant,
    ) -> Option<Response> {
        let cached = match self.cache.get(key) {
            Some(cached) => cached,
            None => {
                metrics::inc_cache_miss(route_label);
                return None;
            }
        };

        let mut response = Response::new(Body::from(cached.body.clone()));
        *response.status_mut() = cached.status;
        *response.headers_mut() = cached.headers.clone();

        let duration = started.elapsed();
        metrics::observe_request(route_label, method.as_str(), cached.status.as_u16(), duration);
        metrics::inc_cache_hit(route_label);
        info!(
            method = %method,
            path = %path,
            status = cached.status.as_u16(),
            upstream = %route_label,
            duration_ms = duration.as_millis() as u64,
            "cache hit"
        );
        Some(response)
    }
}

/// Canonical cache key: method, one space, then the full outgoing URL. Built
/// after the endpoint rewrite so routes pointing at different clusters never
/// share entries.
fn cache_key(method: &Method, target_url: &str) -> String {
    format!("{} {}", method, target_url)
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn end_to_end_headers(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        if !is_hop_by_hop(name) {
            dst.append(name.clone(), value.clone());
        }
    }
    dst
}

/// A 200 without `no-store` or `private` in Cache-Control may be cached.
fn is_cacheable_response(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::OK {
        return false;
    }

    let cache_control = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    !cache_control.contains("no-store") && !cache_control.contains("private")
}

/// TTL for a cache insertion: a valid `max-age` wins, then the route TTL if
/// positive, otherwise the response is not cached at all.
fn cache_ttl(headers: &HeaderMap, route_ttl: Duration) -> Option<Duration> {
    let cache_control = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    for part in cache_control.split(',') {
        let part = part.trim().to_ascii_lowercase();
        if let Some(rest) = part.strip_prefix("max-age=") {
            if let Ok(secs) = rest.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
        }
    }

    if route_ttl > Duration::ZERO {
        return Some(route_ttl);
    }
    None
}
