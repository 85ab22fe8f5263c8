//! Fixed-window rate limiting keyed by client IP
//!
//! Counts requests per IP in the store under `R:<ip>` with a short window
//! TTL; the first request of a window sets the expiry. Limited requests get
//! 429 plus the IETF draft `RateLimit-*` headers. Store failures fail open:
//! a broken limiter must not take down counting.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use super::AppState;

const WINDOW: Duration = Duration::from_secs(3);
const LIMIT: i64 = 30;

fn policy() -> String {
    format!("{LIMIT};w={}", WINDOW.as_secs())
}

fn header(value: String) -> HeaderValue {
    HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("0"))
}

pub(super) async fn fixed_window(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |info| info.0.ip().to_string());
    let key = format!("R:{ip}");

    let count = match state.store.incr(&key).await {
        Ok(count) => count,
        Err(err) => {
            warn!(error = %err, "rate limit store unavailable, letting request through");
            return next.run(request).await;
        }
    };
    if count == 1 {
        let _ = state.store.expire(&key, WINDOW).await;
    }
    let reset_in = state
        .store
        .ttl(&key)
        .await
        .unwrap_or(WINDOW.as_secs() as i64)
        .max(0);
    let reset_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |now| now.as_secs() as i64 + reset_in);
    let remaining = (LIMIT - count).max(0);

    if count > LIMIT {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": format!("Too many requests. Try again in {reset_in}s"),
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(HeaderName::from_static("retry-after"), header(reset_in.to_string()));
        headers.insert(
            HeaderName::from_static("ratelimit-remaining"),
            HeaderValue::from_static("0"),
        );
        headers.insert(HeaderName::from_static("ratelimit-reset"), header(reset_at.to_string()));
        headers.insert(HeaderName::from_static("ratelimit-policy"), header(policy()));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("ratelimit-remaining"),
        header(remaining.to_string()),
    );
    headers.insert(HeaderName::from_static("ratelimit-reset"), header(reset_at.to_string()));
    headers.insert(HeaderName::from_static("ratelimit-policy"), header(policy()));
    response
}
