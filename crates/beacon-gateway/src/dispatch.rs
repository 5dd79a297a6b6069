//! Translates inbound HTTP requests into routed RPC calls and back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use beacon_rpc::{RpcError, RpcRequest, RpcResponse};
use serde_json::Value;

use crate::auth::UserExtractor;
use crate::discovery::DiscoveryClient;
use crate::error::GatewayError;
use crate::routes::RouteTable;

const REFRESH_COOKIE: &str = "refreshToken";
const REFRESH_COOKIE_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Hop-by-hop and transport headers that must not cross the RPC boundary.
const EXCLUDED_HEADERS: [&str; 4] = ["host", "connection", "content-length", "content-encoding"];

/// Shared dispatcher state.
pub struct GatewayState {
    pub discovery: DiscoveryClient,
    pub routes: Arc<RouteTable>,
    pub user_extractor: UserExtractor,
    pub rpc_timeout: Duration,
    /// Service whose responses drive refresh-token cookie side effects.
    pub auth_service: String,
    /// Services that must be discovered before `/ready` reports ready.
    pub critical_services: Vec<String>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("auth_service", &self.auth_service)
            .field("rpc_timeout", &self.rpc_timeout)
            .finish_non_exhaustive()
    }
}

/// `ANY /api/v1/{service}`.
pub async fn handle_service_root(
    State(state): State<Arc<GatewayState>>,
    Path(service): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, service, String::new(), method, query, headers, body).await
}

/// `ANY /api/v1/{service}/{*path}`.
pub async fn handle_service_path(
    State(state): State<Arc<GatewayState>>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, service, path, method, query, headers, body).await
}

async fn dispatch(
    state: Arc<GatewayState>,
    service: String,
    path: String,
    method: Method,
    mut query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = normalise_path(&path);

    // Identity is best-effort; an anonymous request proceeds and the
    // target service decides what it may do.
    let user = state.user_extractor.extract(&headers);

    let Some(client) = state.discovery.client(&service) else {
        tracing::debug!(service = %service, "No client for requested service");
        return GatewayError::ServiceNotFound(service).into_response();
    };

    let Some(route) = state.routes.find_route(&service, &path, method.as_str()) else {
        tracing::debug!(service = %service, path = %path, method = %method, "No route matched");
        return GatewayError::RouteNotFound {
            method: method.to_string(),
            path,
        }
        .into_response();
    };

    query.extend(route.path_params);

    let request = RpcRequest {
        method: method.to_string(),
        path: path.clone(),
        query,
        headers: forwardable_headers(&headers),
        body: parse_body(&body),
        user: user.and_then(|u| serde_json::to_value(u).ok()),
    };

    tracing::debug!(
        service = %service,
        pattern = %route.message_pattern,
        path = %path,
        "Dispatching to backend"
    );

    match client
        .call(&route.message_pattern, request, state.rpc_timeout)
        .await
    {
        Ok(response) => render(&state, &service, &path, &method, response),
        Err(RpcError::Timeout) => {
            tracing::warn!(service = %service, pattern = %route.message_pattern, "RPC timed out");
            GatewayError::RpcTimeout(service).into_response()
        }
        Err(e) => {
            tracing::error!(service = %service, error = %e, "RPC dispatch failed");
            GatewayError::Transport(e.to_string()).into_response()
        }
    }
}

/// Translates the RPC envelope back into HTTP, attaching any auth-cookie
/// side effect. The response is written exactly once.
fn render(
    state: &GatewayState,
    service: &str,
    path: &str,
    method: &Method,
    envelope: RpcResponse,
) -> Response {
    let status =
        StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let cookie = auth_cookie_effect(state, service, path, method, &envelope);

    let mut response = if envelope.is_error() {
        let message = envelope
            .error
            .clone()
            .unwrap_or_else(|| "Request failed".to_string());
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    } else {
        (status, Json(envelope.data.clone().unwrap_or(Value::Null))).into_response()
    };

    if let Some(cookie) = cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }

    response
}

/// Cookie side effects for auth-service flows: login/register/refresh set
/// the refresh token, logout clears it, and a rejected refresh clears it
/// so a dead token family cannot loop forever.
fn auth_cookie_effect(
    state: &GatewayState,
    service: &str,
    path: &str,
    method: &Method,
    envelope: &RpcResponse,
) -> Option<HeaderValue> {
    if service != state.auth_service || *method != Method::POST {
        return None;
    }

    if envelope.is_error() {
        let auth_failure = matches!(envelope.status, 401 | 403);
        return (auth_failure && matches!(path, "/refresh" | "/logout")).then(clear_refresh_cookie);
    }

    match path {
        "/login" | "/register" | "/refresh" => envelope
            .data
            .as_ref()
            .and_then(|data| data.get(REFRESH_COOKIE))
            .and_then(Value::as_str)
            .and_then(set_refresh_cookie),
        "/logout" => Some(clear_refresh_cookie()),
        _ => None,
    }
}

fn set_refresh_cookie(token: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{REFRESH_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/api/v1/auth; \
         Max-Age={REFRESH_COOKIE_MAX_AGE_SECS}"
    ))
    .ok()
}

fn clear_refresh_cookie() -> HeaderValue {
    HeaderValue::from_static(
        "refreshToken=; HttpOnly; SameSite=Strict; Path=/api/v1/auth; Max-Age=0",
    )
}

/// Service-relative path: always rooted, `""` becomes `"/"`.
fn normalise_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    format!("/{trimmed}")
}

fn forwardable_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !EXCLUDED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Bodies are opaque: JSON passes through structured, anything else is
/// forwarded as a string.
fn parse_body(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(
            String::from_utf8_lossy(body).into_owned(),
        )),
    }
}
