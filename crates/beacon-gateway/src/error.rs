//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Endpoint not found: {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("Request to {0} service timed out")]
    RpcTimeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::RpcTimeout(_) => "rpc_timeout",
            Self::Transport(_) => "transport_error",
            Self::Store(_) => "store_error",
            Self::Io(_) => "io_error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::ServiceNotFound(_) | Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RpcTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Store(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Bodies stay short and stable; internal detail goes to logs only.
        let body = match &self {
            Self::ServiceNotFound(_) => serde_json::json!({ "error": "Service not found" }),
            Self::RouteNotFound { .. } => serde_json::json!({ "error": "Endpoint not found" }),
            Self::RpcTimeout(service) => serde_json::json!({
                "error": "Gateway Timeout",
                "message": format!("Request to {service} service timed out"),
            }),
            Self::Transport(_) => serde_json::json!({
                "error": "Bad Gateway",
                "message": "Upstream service failure",
            }),
            Self::Config(_) | Self::Store(_) | Self::Io(_) => {
                serde_json::json!({ "error": "Internal server error" })
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            GatewayError::ServiceNotFound("users".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RouteNotFound {
                method: "GET".into(),
                path: "/x".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RpcTimeout("users".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Transport("broken pipe".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn error_types() {
        assert_eq!(
            GatewayError::RpcTimeout("users".into()).error_type(),
            "rpc_timeout"
        );
        assert_eq!(
            GatewayError::ServiceNotFound("users".into()).error_type(),
            "service_not_found"
        );
    }
}
