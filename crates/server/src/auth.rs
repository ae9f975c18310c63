//! Authentication and request tracing.
//!
//! Publish and update endpoints take `Authorization: Bearer <token>`
//! against the fork's configured update token. Private-fork reads take
//! HTTP Basic auth against the fork's user table. Both comparisons go
//! through SHA-256 digests of the operands, so the byte comparison runs
//! over fixed-size values regardless of what the client sent.

use crate::error::{ApiError, ApiResult};
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use depot_core::config::ForkConfig;
use sha2::{Digest, Sha256};
use tracing::Instrument;
use uuid::Uuid;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware that runs every request inside a trace-ID span.
pub async fn trace_middleware(mut req: Request, next: Next) -> Response {
    let trace_id = TraceId::new();
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    next.run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await
}

/// Compare two secrets by their SHA-256 digests.
fn digests_match(provided: &[u8], expected: &[u8]) -> bool {
    Sha256::digest(provided) == Sha256::digest(expected)
}

/// Extract the bearer token from the Authorization header.
/// Per RFC 6750 the scheme is case-insensitive.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// Extract Basic-auth credentials from the Authorization header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if value.len() < 6 || !value[..6].eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value[6..].trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Require a valid update token for a fork's publish/update endpoints.
pub fn check_update_token(fork: &str, config: &ForkConfig, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = &config.update_token else {
        return Err(ApiError::Unauthorized(format!(
            "fork {fork} has no update token configured"
        )));
    };

    let Some(provided) = bearer_token(headers) else {
        return Err(ApiError::Unauthorized("missing bearer token".to_string()));
    };

    if digests_match(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid update token".to_string()))
    }
}

/// Gate read access to a fork. Public forks always pass; private forks
/// require Basic auth against the fork's user table, answering failures
/// with a `fork_<name>` realm challenge.
pub fn check_read_access(fork: &str, config: &ForkConfig, headers: &HeaderMap) -> ApiResult<()> {
    if !config.private {
        return Ok(());
    }

    let challenge = || ApiError::BasicAuthRequired {
        realm: format!("fork_{fork}"),
    };

    let Some((user, password)) = basic_credentials(headers) else {
        return Err(challenge());
    };
    let Some(expected) = config.private_users.get(&user) else {
        return Err(challenge());
    };

    if digests_match(password.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(challenge())
    }
}
