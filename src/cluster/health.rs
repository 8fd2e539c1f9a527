use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{Cluster, HealthCheckSettings};
use crate::observability::metrics;

/// Start the probe loop for one cluster. Returns `None` when the cluster has
/// no health-check configuration. The loop fires every `interval` and exits
/// at the next tick boundary once `shutdown` is cancelled.
pub fn spawn(
    cluster: Arc<Cluster>,
    client: Client,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let settings = cluster.health()?.clone();

    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + settings.interval;
        let mut ticker = tokio::time::interval_at(start, settings.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(cluster = cluster.name(), "health check loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    run_probe_round(&cluster, &client, &settings).await;
                }
            }
        }
    }))
}

/// Probe every endpoint once and fold the outcomes into the cluster state,
/// then publish the unhealthy-endpoint gauge for this cluster.
pub async fn run_probe_round(cluster: &Cluster, client: &Client, settings: &HealthCheckSettings) {
    for (index, url) in cluster.probe_targets(&settings.path) {
        let ok = probe(client, url.clone(), settings.timeout).await;
        if !ok {
            warn!(cluster = cluster.name(), url = %url, "health probe failed");
        }
        cluster.record_probe(index, ok);
    }

    metrics::set_cluster_unhealthy(cluster.name(), cluster.unhealthy_count() as f64);
}

/// One GET against the probe URL. Success means the request completed and
/// returned a status in [200, 400).
async fn probe(client: &Client, url: Url, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            (200..400).contains(&code)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn spawn_upstream(healthy: Arc<AtomicBool>) -> SocketAddr {
        let app = Router::new().route(
            "/health",
            get(move || {
                let healthy = healthy.clone();
                async move {
                    if healthy.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn settings(unhealthy_threshold: u32, healthy_threshold: u32) -> HealthCheckSettings {
        HealthCheckSettings {
            path: "/health".to_string(),
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(500),
            unhealthy_threshold,
            healthy_threshold,
        }
    }

    #[tokio::test]
    async fn probes_demote_and_restore_endpoints() {
        let healthy = Arc::new(AtomicBool::new(false));
        let addr = spawn_upstream(healthy.clone()).await;

        let settings = settings(2, 1);
        let cluster = Cluster::new(
            "hc",
            vec![Url::parse(&format!("http://{addr}")).unwrap()],
            Some(settings.clone()),
            None,
        );
        let client = Client::new();

        run_probe_round(&cluster, &client, &settings).await;
        assert!(
            cluster.endpoint_alive(0),
            "one failure is below the unhealthy threshold"
        );
        assert_eq!(cluster.probe_counters(0), (0, 1));

        run_probe_round(&cluster, &client, &settings).await;
        assert!(!cluster.endpoint_alive(0), "second failure crosses the threshold");
        assert_eq!(cluster.unhealthy_count(), 1);
        assert!(cluster.pick_endpoint().is_err());

        healthy.store(true, Ordering::SeqCst);
        run_probe_round(&cluster, &client, &settings).await;
        assert!(cluster.endpoint_alive(0), "a success at threshold 1 restores liveness");
        let (successes, failures) = cluster.probe_counters(0);
        assert!(successes >= 1);
        assert_eq!(failures, 0, "a successful probe resets the failure counter");
        assert!(cluster.pick_endpoint().is_ok());
    }

    #[tokio::test]
    async fn non_2xx_below_400_counts_as_success() {
        let app = Router::new().route("/health", get(|| async { StatusCode::NOT_MODIFIED }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = settings(1, 1);
        let cluster = Cluster::new(
            "redirects",
            vec![Url::parse(&format!("http://{addr}")).unwrap()],
            Some(settings.clone()),
            None,
        );

        run_probe_round(&cluster, &Client::new(), &settings).await;
        assert!(cluster.endpoint_alive(0));
        assert_eq!(cluster.probe_counters(0), (1, 0));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_probe() {
        // Bind a listener and drop it so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = settings(1, 1);
        let cluster = Cluster::new(
            "down",
            vec![Url::parse(&format!("http://{addr}")).unwrap()],
            Some(settings.clone()),
            None,
        );

        run_probe_round(&cluster, &Client::new(), &settings).await;
        assert!(!cluster.endpoint_alive(0));
        assert_eq!(cluster.unhealthy_count(), 1);
    }
}
