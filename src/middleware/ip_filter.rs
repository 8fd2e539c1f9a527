use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use ipnet::IpNet;
use tracing::info;

/// Rejects requests whose client IP falls inside any configured CIDR range.
/// A client IP that cannot be derived passes through.
pub struct IpFilter {
    nets: Vec<IpNet>,
}

impl IpFilter {
    pub fn new(cidrs: &[String]) -> Result<Self, ipnet::AddrParseError> {
        let mut nets = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            nets.push(cidr.parse::<IpNet>()?);
        }
        Ok(Self { nets })
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    /// Client IP: first X-Forwarded-For entry when it parses, otherwise the
    /// remote address host (with or without a port).
    pub fn client_ip(&self, headers: &HeaderMap, remote: &str) -> Option<IpAddr> {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return Some(ip);
                }
            }
        }

        if let Ok(addr) = remote.parse::<SocketAddr>() {
            return Some(addr.ip());
        }
        remote.parse().ok()
    }
}

/// Axum middleware entry point for the filter.
pub async fn block_denied(
    State(filter): State<Arc<IpFilter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let remote = connect_info
        .map(|info| info.0.to_string())
        .unwrap_or_default();

    match filter.client_ip(req.headers(), &remote) {
        Some(ip) if filter.is_blocked(ip) => {
            info!(ip = %ip, path = req.uri().path(), "ip blocked");
            StatusCode::FORBIDDEN.into_response()
        }
        _ => next.run(req).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn filter(cidrs: &[&str]) -> IpFilter {
        let cidrs: Vec<String> = cidrs.iter().map(|s| s.to_string()).collect();
        IpFilter::new(&cidrs).expect("parse cidrs")
    }

    #[test]
    fn rejects_invalid_cidr() {
        assert!(IpFilter::new(&["not-a-cidr".to_string()]).is_err());
    }

    #[test]
    fn blocks_ips_inside_ranges() {
        let filter = filter(&["10.0.0.0/8", "192.168.1.0/24"]);

        assert!(filter.is_blocked("10.1.2.3".parse().unwrap()));
        assert!(filter.is_blocked("192.168.1.200".parse().unwrap()));
        assert!(!filter.is_blocked("192.168.2.1".parse().unwrap()));
        assert!(!filter.is_blocked("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let filter = filter(&["10.0.0.0/8"]);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.5.5.5, 172.16.0.1".parse().unwrap());
        assert_eq!(
            filter.client_ip(&headers, "172.16.0.9:1234"),
            Some("10.5.5.5".parse().unwrap())
        );

        let headers = HeaderMap::new();
        assert_eq!(
            filter.client_ip(&headers, "172.16.0.9:1234"),
            Some("172.16.0.9".parse().unwrap())
        );
        assert_eq!(
            filter.client_ip(&headers, "172.16.0.9"),
            Some("172.16.0.9".parse().unwrap())
        );
        assert_eq!(filter.client_ip(&headers, "garbage"), None);
    }

    async fn request_status(
        filter: IpFilter,
        remote: &str,
        forwarded_for: Option<&str>,
    ) -> StatusCode {
        let app = Router::new()
            .route("/", get(|| async { StatusCode::OK }))
            .layer(from_fn_with_state(Arc::new(filter), block_denied));

        let mut builder = Request::builder().uri("/");
        if let Some(xff) = forwarded_for {
            builder = builder.header("x-forwarded-for", xff);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Ok(addr) = remote.parse::<SocketAddr>() {
            request.extensions_mut().insert(ConnectInfo(addr));
        }

        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn blocked_ip_gets_forbidden() {
        let status = request_status(filter(&["10.0.0.0/8"]), "10.1.2.3:5000", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allowed_ip_passes() {
        let status = request_status(filter(&["10.0.0.0/8"]), "172.16.0.9:5000", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn forwarded_for_drives_the_decision() {
        let status = request_status(
            filter(&["10.0.0.0/8"]),
            "172.16.0.9:5000",
            Some("10.9.9.9"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unparseable_client_ip_fails_open() {
        let status = request_status(
            filter(&["10.0.0.0/8"]),
            "not-an-address",
            Some("also-not-an-ip"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
