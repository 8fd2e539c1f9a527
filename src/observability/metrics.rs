use std::time::Duration;

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and register metric descriptions.
/// Subsequent calls return the already-installed handle.
pub fn install() -> Result<PrometheusHandle> {
    let handle = HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

        describe_counter!(
            "warpgate_http_requests_total",
            "Total number of HTTP requests handled by warpgate"
        );
        describe_histogram!(
            "warpgate_http_request_duration_seconds",
            "Duration of HTTP requests handled by warpgate"
        );
        describe_counter!("warpgate_cache_hits_total", "Total cache hits");
        describe_counter!("warpgate_cache_misses_total", "Total cache misses");
        describe_gauge!(
            "warpgate_cluster_unhealthy_endpoints",
            "Number of unhealthy endpoints per cluster"
        );

        Ok::<_, anyhow::Error>(handle)
    })?;

    Ok(handle.clone())
}

pub fn observe_request(route: &str, method: &str, code: u16, duration: Duration) {
    counter!(
        "warpgate_http_requests_total",
        "route" => route.to_string(),
        "method" => method.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
    histogram!(
        "warpgate_http_request_duration_seconds",
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn inc_cache_hit(route: &str) {
    counter!("warpgate_cache_hits_total", "route" => route.to_string()).increment(1);
}

pub fn inc_cache_miss(route: &str) {
    counter!("warpgate_cache_misses_total", "route" => route.to_string()).increment(1);
}

pub fn set_cluster_unhealthy(cluster: &str, value: f64) {
    gauge!("warpgate_cluster_unhealthy_endpoints", "cluster" => cluster.to_string()).set(value);
}
