//! User-context extraction from bearer tokens and auth cookies.
//!
//! Extraction is strictly best-effort: a missing or invalid token yields
//! `None` and the request proceeds unauthenticated. Downstream authorisation
//! belongs to the target service.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Identity forwarded to backend services inside the RPC envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// Decodes access tokens from the `Authorization` header or the
/// `accessToken` cookie.
#[derive(Clone)]
pub struct UserExtractor {
    key: DecodingKey,
    validation: Validation,
}

impl UserExtractor {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Never fails: anything short of a valid token is `None`.
    pub fn extract(&self, headers: &HeaderMap) -> Option<UserContext> {
        let token = bearer_token(headers).or_else(|| cookie_value(headers, "accessToken"))?;

        match decode::<Claims>(&token, &self.key, &self.validation) {
            Ok(data) => Some(UserContext {
                id: data.claims.sub,
                email: data.claims.email,
                roles: data.claims.roles,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Could not extract user from request");
                None
            }
        }
    }
}

impl std::fmt::Debug for UserExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserExtractor").finish_non_exhaustive()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;

    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
