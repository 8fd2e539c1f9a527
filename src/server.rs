use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Host, Request, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TlsConfig};
use crate::middleware::{self, ip_filter, IpFilter, Middleware};
use crate::proxy::Engine;

/// How long in-flight requests get to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// One network listener bound to either the proxy application or a redirect
/// handler.
pub struct ListenerSpec {
    pub name: String,
    pub address: String,
    pub tls: TlsConfig,
    router: Router,
}

/// Assemble the proxy router: `/metrics` first, then the middleware-wrapped
/// engine as the catch-all.
pub fn build_router(
    engine: Arc<Engine>,
    metrics_handle: PrometheusHandle,
    ip_block_cidrs: &[String],
) -> Result<Router> {
    let state = AppState { engine };
    let proxy = Router::new()
        .fallback(proxy_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let mut middlewares: Vec<Middleware> = Vec::new();
    if !ip_block_cidrs.is_empty() {
        let filter = Arc::new(
            IpFilter::new(ip_block_cidrs).context("invalid ipBlockCIDRs")?,
        );
        middlewares.push(Box::new(move |router| {
            router.layer(axum::middleware::from_fn_with_state(
                filter,
                ip_filter::block_denied,
            ))
        }));
    }
    let proxy = middleware::chain(proxy, middlewares);

    Ok(Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .fallback_service(proxy))
}

async fn proxy_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    state.engine.handle(connect_info.map(|info| info.0), req).await
}

/// Resolve the configured listeners. Without a `listeners` section the
/// `server` block describes a single default listener.
pub fn build_listeners(config: &Config, app: Router) -> Result<Vec<ListenerSpec>> {
    if config.listeners.is_empty() {
        return Ok(vec![ListenerSpec {
            name: "default".to_string(),
            address: config.server.address.clone(),
            tls: config.server.tls.clone(),
            router: app,
        }]);
    }

    let by_name: HashMap<&str, &crate::config::ListenerConfig> = config
        .listeners
        .iter()
        .map(|l| (l.name.as_str(), l))
        .collect();

    let mut listeners = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let router = match &listener.redirect_to {
            Some(target) if !listener.tls.enabled => {
                let target = by_name.get(target.as_str()).with_context(|| {
                    format!(
                        "listener {:?} has redirectTo={:?} but target not found",
                        listener.name, target
                    )
                })?;
                redirect_router(&target.address)
            }
            _ => app.clone(),
        };

        listeners.push(ListenerSpec {
            name: listener.name.clone(),
            address: listener.address.clone(),
            tls: listener.tls.clone(),
            router,
        });
    }

    Ok(listeners)
}

/// Bind every listener, serve them, and drain on cancellation. A bind
/// failure is fatal; a certificate failure only takes down its listener.
pub async fn run(specs: Vec<ListenerSpec>, shutdown: CancellationToken) -> Result<()> {
    let mut bound = Vec::with_capacity(specs.len());
    for spec in specs {
        let listener = TcpListener::bind(&spec.address)
            .await
            .with_context(|| format!("bind {} for listener {:?}", spec.address, spec.name))?;
        bound.push((listener, spec));
    }

    let mut tasks = JoinSet::new();
    for (listener, spec) in bound {
        let token = shutdown.clone();
        let name = spec.name.clone();
        info!(listener = %name, address = %spec.address, tls = spec.tls.enabled, "listener started");
        tasks.spawn(async move {
            if let Err(err) = serve_listener(listener, spec, token).await {
                error!(listener = %name, error = %err, "listener failed");
            }
        });
    }

    shutdown.cancelled().await;

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("drain deadline exceeded, aborting remaining connections");
        tasks.abort_all();
    }

    Ok(())
}

async fn serve_listener(
    listener: TcpListener,
    spec: ListenerSpec,
    shutdown: CancellationToken,
) -> Result<()> {
    if spec.tls.enabled {
        serve_tls(listener, spec, shutdown).await
    } else {
        let router = spec.router;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Into::into)
    }
}

async fn serve_tls(
    listener: TcpListener,
    spec: ListenerSpec,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls_config = load_rustls_config(&spec.tls.cert_file, &spec.tls.key_file)
        .with_context(|| format!("load certificate for listener {:?}", spec.name))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    error!(listener = %spec.name, error = %err, "accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = spec.router.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(peer = %peer, error = %err, "tls handshake failed");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
                let router = router.clone();
                async move {
                    req.extensions_mut().insert(ConnectInfo(peer));
                    router.oneshot(req).await
                }
            });

            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(peer = %peer, error = %err, "tls connection ended");
            }
        });
    }
}

fn load_rustls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    let cert_file =
        File::open(cert_path).with_context(|| format!("open cert file {:?}", cert_path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parse cert file {:?}", cert_path))?;

    let key_file = File::open(key_path).with_context(|| format!("open key file {:?}", key_path))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("parse key file {:?}", key_path))?
        .with_context(|| format!("no private key found in {:?}", key_path))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("configure certificate")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Catch-all router that answers 301 towards the HTTPS listener, keeping the
/// original path and query.
fn redirect_router(target_addr: &str) -> Router {
    let port = target_addr
        .rsplit_once(':')
        .map(|(_, port)| port.to_string())
        .unwrap_or_default();

    Router::new().fallback(move |Host(host): Host, uri: Uri| {
        let port = port.clone();
        async move {
            let host = strip_port(&host).to_string();
            let authority = if port.is_empty() || port == "443" {
                host
            } else {
                format!("{host}:{port}")
            };
            let path_and_query = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let location = format!("https://{authority}{path_and_query}");

            (
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, location)],
            )
                .into_response()
        }
    })
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((inner, _)) = rest.split_once(']') {
            return inner;
        }
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    async fn redirect_location(target_addr: &str, host: &str, path: &str) -> (StatusCode, String) {
        let app = redirect_router(target_addr);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(path)
                    .header(header::HOST, host)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        (status, location)
    }

    #[tokio::test]
    async fn redirects_with_target_port() {
        let (status, location) =
            redirect_location("0.0.0.0:8443", "example.com:8080", "/x?y=1").await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location, "https://example.com:8443/x?y=1");
    }

    #[tokio::test]
    async fn omits_default_https_port() {
        let (status, location) = redirect_location("0.0.0.0:443", "example.com", "/login").await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location, "https://example.com/login");
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
    }

    #[test]
    fn default_listener_from_server_block() {
        let mut config = Config::default();
        config.server.address = "0.0.0.0:9000".to_string();

        let listeners = build_listeners(&config, Router::new()).expect("build listeners");
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].name, "default");
        assert_eq!(listeners[0].address, "0.0.0.0:9000");
        assert!(!listeners[0].tls.enabled);
    }

    #[test]
    fn listeners_override_server_block() {
        let yaml = r#"
listeners:
  - name: http
    address: "0.0.0.0:8080"
    redirectTo: https
  - name: https
    address: "0.0.0.0:8443"
    tls:
      enabled: true
      certFile: cert.pem
      keyFile: key.pem
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        let listeners = build_listeners(&config, Router::new()).expect("build listeners");
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].name, "http");
        assert_eq!(listeners[1].name, "https");
        assert!(listeners[1].tls.enabled);
    }

    #[test]
    fn redirect_to_missing_listener_fails() {
        let yaml = r#"
listeners:
  - name: http
    address: "0.0.0.0:8080"
    redirectTo: nowhere
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(build_listeners(&config, Router::new()).is_err());
    }
}
