use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use warpgate::cache::ResponseCache;
use warpgate::cluster::{health, Cluster};
use warpgate::config::Config;
use warpgate::observability;
use warpgate::proxy::{Director, Engine, Route};
use warpgate::server;
use warpgate::upstream;

#[derive(Parser, Debug)]
#[command(name = "warpgate")]
#[command(about = "A small caching HTTP reverse proxy with health-checked clusters")]
struct Args {
    #[arg(short, long, default_value = "./configs/warpgate.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    observability::init_tracing();

    let config = Config::load(&args.config).await?;
    let metrics_handle = observability::metrics::install()?;
    let client = upstream::build_client(config.upstream.insecure_skip_verify)?;

    let shutdown = CancellationToken::new();

    let mut clusters = HashMap::new();
    for cluster_config in &config.clusters {
        let cluster = Arc::new(Cluster::from_config(cluster_config)?);
        health::spawn(cluster.clone(), client.clone(), shutdown.clone());
        clusters.insert(cluster_config.name.clone(), cluster);
    }

    let routes: Vec<Route> = config
        .routes
        .iter()
        .map(|route| Route {
            name: route.name.clone(),
            prefix: route.path_prefix.clone(),
            cluster: route.cluster.clone(),
            cache_enabled: config.route_cache_enabled(route),
            cache_ttl: config.route_ttl(route),
        })
        .collect();

    let cache = Arc::new(ResponseCache::new(config.cache.max_entries));
    let engine = Arc::new(Engine::new(
        Director::new(routes),
        clusters,
        cache,
        client,
        config.cache.max_body_bytes,
    ));

    let app = server::build_router(engine, metrics_handle, &config.server.ip_block_cidrs)?;
    let listeners = server::build_listeners(&config, app)?;

    info!("warpgate started");

    let mut server_task = tokio::spawn(server::run(listeners, shutdown.clone()));

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutdown signal received, draining");
            shutdown.cancel();
        }
        result = &mut server_task => {
            error!("server exited unexpectedly");
            return result?;
        }
    }

    server_task.await??;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
