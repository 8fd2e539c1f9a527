pub mod director;
pub mod engine;
mod stream;

pub use director::{Director, Route};
pub use engine::Engine;

use axum::http::{HeaderMap, Method};
use std::time::Duration;

/// Routing decision for one request, produced by the director and consumed
/// by the engine. Not stored anywhere.
#[derive(Debug, Clone)]
pub struct RouteMetadata {
    pub route_name: String,
    pub cluster_name: String,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
}

/// The shape of the outgoing request before endpoint selection. The director
/// leaves scheme and host unset; the engine fills them in from the picked
/// endpoint.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
}
