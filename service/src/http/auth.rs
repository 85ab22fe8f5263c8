//! Admin ownership middleware
//!
//! Mutating routes require proof of ownership: the bearer token (or
//! `?token=`) must equal the admin token stored beside the counter. A
//! counter that was never explicitly created has no admin token and cannot
//! be mutated at all; that case answers 400 with an explanatory message,
//! deliberately distinct from the 401 a wrong token earns.

use std::collections::HashMap;

use abacus_core::CounterError;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use super::handlers::resolve_name_lenient;
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub(super) struct TokenQuery {
    token: Option<String>,
}

fn extract_token(headers: &HeaderMap, query: &TokenQuery) -> Result<String, CounterError> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Ok(bearer.to_owned());
    }
    query
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or(CounterError::MissingToken)
}

pub(super) async fn require_admin(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let token = match extract_token(&headers, &query) {
        Ok(token) => token,
        Err(err) => return ApiError(err).into_response(),
    };
    let name = match resolve_name_lenient(&params, &headers) {
        Ok(name) => name,
        Err(err) => return err.into_response(),
    };
    match state.counters.authorize(&name, &token).await {
        Ok(()) => next.run(request).await,
        Err(err) => ApiError(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn no_token() -> TokenQuery {
        TokenQuery { token: None }
    }

    #[test]
    fn bearer_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret-token"),
        );
        assert_eq!(extract_token(&headers, &no_token()).unwrap(), "secret-token");
    }

    #[test]
    fn query_token_is_the_fallback() {
        let query = TokenQuery {
            token: Some("query-token".to_owned()),
        };
        assert_eq!(
            extract_token(&HeaderMap::new(), &query).unwrap(),
            "query-token"
        );
    }

    #[test]
    fn missing_token_is_an_auth_error() {
        let err = extract_token(&HeaderMap::new(), &no_token()).unwrap_err();
        assert!(matches!(err, CounterError::MissingToken));
        assert!(err.to_string().contains("Token is required"));
    }

    #[test]
    fn malformed_authorization_falls_back_to_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_token(&headers, &no_token()).is_err());
    }
}
