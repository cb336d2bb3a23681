//! API-key authentication and per-key rate limiting

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::api::{error_response, AppState};

/// Requests per key per window.
pub const RATE_LIMIT: u64 = 1000;
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Middleware guarding the protected routes: a key must be presented via
/// `X-API-Key` or `Authorization: Bearer`, match the configured key when one
/// is set, and stay under the fixed-window rate limit.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(presented) = extract_api_key(request.headers()) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing API key", None);
    };

    if !state.api_key.is_empty() && presented != state.api_key {
        tracing::warn!(path = %request.uri().path(), "invalid API key attempt");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API key", None);
    }

    let key_hash = hash_api_key(&presented);
    match state
        .bloom
        .incr_rate_limit(&key_hash, RATE_LIMIT, RATE_WINDOW)
        .await
    {
        Ok((count, exceeded)) => {
            if exceeded {
                let remaining = state
                    .bloom
                    .rate_limit_remaining(&key_hash, RATE_LIMIT)
                    .await
                    .unwrap_or(0);
                let mut response = error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Rate limit exceeded",
                    Some("Please slow down your requests"),
                );
                set_rate_limit_headers(&mut response, remaining);
                return response;
            }

            let remaining = RATE_LIMIT.saturating_sub(count);
            let mut response = next.run(request).await;
            set_rate_limit_headers(&mut response, remaining);
            response
        }
        Err(e) => {
            // Rate limiting degrades open: an unreachable counter store
            // must not take the read path down with it.
            tracing::error!(error = %e, "rate limit check failed");
            next.run(request).await
        }
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn set_rate_limit_headers(response: &mut Response, remaining: u64) {
    let headers = response.headers_mut();
    if let Ok(limit) = RATE_LIMIT.to_string().parse() {
        headers.insert("X-RateLimit-Limit", limit);
    }
    if let Ok(remaining) = remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", remaining);
    }
}

/// SHA-256 of the presented key; the raw key never reaches logs or Redis.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_from_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert_eq!(extract_api_key(&headers), Some("secret".to_string()));
    }

    #[test]
    fn extracts_from_bearer_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(extract_api_key(&headers), Some("tok".to_string()));
    }

    #[test]
    fn x_api_key_wins_over_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("a"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer b"));
        assert_eq!(extract_api_key(&headers), Some("a".to_string()));
    }

    #[test]
    fn missing_or_malformed_key_yields_none() {
        assert_eq!(extract_api_key(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_api_key(&headers), None);
    }

    #[test]
    fn api_key_hash_is_64_hex() {
        let hash = hash_api_key("secret");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_api_key("secret"));
    }
}
