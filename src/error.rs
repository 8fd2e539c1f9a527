use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the request pipeline.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no route for path {0}")]
    NoRoute(String),

    #[error("no such cluster: {0}")]
    UnknownCluster(String),

    #[error("no available endpoint in cluster: {0}")]
    NoAvailableEndpoint(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UnknownCluster(_) => StatusCode::BAD_GATEWAY,
            ProxyError::NoAvailableEndpoint(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::NoRoute(_) => "NO_ROUTE",
            ProxyError::UnknownCluster(_) => "UNKNOWN_CLUSTER",
            ProxyError::NoAvailableEndpoint(_) => "NO_AVAILABLE_ENDPOINT",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
