//! Request handlers for the REST surface
//!
//! Thin translations between HTTP and the operations façade: resolve the
//! counter name from path parameters and headers, run the operation, shape
//! the response. JSONP wrapping is supported on `/get` and `/hit` via
//! `?callback=`.

use std::collections::HashMap;

use abacus_core::{CounterError, CounterName, RequestHints};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, AppState};
use crate::badge::{self, BadgeQuery};
use crate::{DOCS_URL, VERSION};

/// Extract `(namespace, key)` route parameters; the wildcard key segment is
/// absent on single-segment routes.
fn path_params(params: &HashMap<String, String>) -> (&str, &str) {
    (
        params.get("namespace").map_or("", String::as_str),
        params.get("key").map_or("", String::as_str),
    )
}

fn request_hints(headers: &HeaderMap) -> RequestHints<'_> {
    let header_str = |name| headers.get(name).and_then(|v| v.to_str().ok());
    RequestHints {
        origin: header_str(header::ORIGIN),
        referer: header_str(header::REFERER),
    }
}

/// Resolve and validate a counter name from the request
pub(super) fn resolve_name(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<CounterName, ApiError> {
    let (namespace, key) = path_params(params);
    Ok(CounterName::resolve(namespace, key, request_hints(headers))?)
}

/// Resolve without segment validation, for read-only lookups
pub(super) fn resolve_name_lenient(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<CounterName, ApiError> {
    let (namespace, key) = path_params(params);
    Ok(CounterName::resolve_lenient(
        namespace,
        key,
        request_hints(headers),
    )?)
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackQuery {
    callback: Option<String>,
}

/// `{"value":N}`, optionally wrapped as JSONP
fn value_response(value: i64, callback: &CallbackQuery) -> Response {
    let body = json!({ "value": value });
    match callback.callback.as_deref() {
        Some(function) if !function.is_empty() => (
            [(header::CONTENT_TYPE, "application/javascript")],
            format!("{function}({body});"),
        )
            .into_response(),
        _ => Json(body).into_response(),
    }
}

fn shield_response(svg: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (
                header::CACHE_CONTROL,
                "max-age=0, no-cache, no-store, must-revalidate",
            ),
        ],
        svg,
    )
        .into_response()
}

// ============================================================================
// Public counter routes
// ============================================================================

#[derive(Debug, Deserialize)]
pub(super) struct CreateQuery {
    initializer: Option<String>,
}

pub(super) async fn create_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let initial_value = match query.initializer.as_deref() {
        None | Some("") => 0,
        Some(raw) => raw.parse().map_err(|_| {
            CounterError::Validation("initializer must be a number".to_owned())
        })?,
    };
    let created = state.counters.create(&name, initial_value).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub(super) async fn create_random(
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let created = state.counters.create_random().await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub(super) async fn hit_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(callback): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.hit(&name).await?;
    Ok(value_response(value, &callback))
}

pub(super) async fn hit_shield(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<BadgeQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.hit(&name).await?;
    Ok(shield_response(badge::render(&query, value)))
}

pub(super) async fn get_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(callback): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.get(&name).await?;
    Ok(value_response(value, &callback))
}

pub(super) async fn get_shield(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<BadgeQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.get(&name).await?;
    Ok(shield_response(badge::render(&query, value)))
}

pub(super) async fn info_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name_lenient(&params, &headers)?;
    let info = state.counters.info(&name).await?;
    Ok(Json(info).into_response())
}

// ============================================================================
// Admin routes (behind the ownership middleware)
// ============================================================================

#[derive(Debug, Deserialize)]
pub(super) struct ValueQuery {
    value: Option<String>,
}

fn required_value(query: &ValueQuery, no_floats_hint: bool) -> Result<i64, CounterError> {
    let raw = query.value.as_deref().filter(|v| !v.is_empty()).ok_or_else(|| {
        CounterError::Validation(
            "value is required, please provide a number in the fmt of ?value=NEW_VALUE"
                .to_owned(),
        )
    })?;
    raw.parse().map_err(|_| {
        CounterError::Validation(if no_floats_hint {
            "value must be a number, this means no floats.".to_owned()
        } else {
            "value must be a number".to_owned()
        })
    })
}

pub(super) async fn set_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<ValueQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let value = required_value(&query, false)?;
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.set(&name, value).await?;
    Ok(Json(json!({ "value": value })).into_response())
}

pub(super) async fn reset_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.reset(&name).await?;
    Ok(Json(json!({ "value": value })).into_response())
}

pub(super) async fn update_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<ValueQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let delta = required_value(&query, true)?;
    let name = resolve_name(&params, &headers)?;
    let value = state.counters.update_by(&name, delta).await?;
    Ok(Json(json!({ "value": value })).into_response())
}

pub(super) async fn delete_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name_lenient(&params, &headers)?;
    let deleted = state.counters.delete(&name).await?;
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Deleted key: {deleted}"),
    }))
    .into_response())
}

// ============================================================================
// Service routes
// ============================================================================

pub(super) async fn healthcheck(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime": uptime_string(state.started_at.elapsed()),
    }))
    .into_response()
}

pub(super) async fn docs_redirect() -> Redirect {
    Redirect::permanent(DOCS_URL)
}

pub(super) async fn metrics_export() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        crate::metrics::gather(),
    )
        .into_response()
}

pub(super) async fn stats_view(State(state): State<AppState>) -> Result<Response, ApiError> {
    let info_raw = state.store.info().await.map_err(CounterError::from)?;
    let info = parse_info_sections(&info_raw);
    let section = |section: &str, key: &str| {
        info.get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .unwrap_or_default()
    };

    let total = read_stat(&state, "Total").await;
    let hits = read_stat(&state, "hit").await;
    let gets = read_stat(&state, "get").await;
    let creates = read_stat(&state, "create").await;
    // 60 hits per key, the observed average across the first six million
    // requests.
    let total_keys = creates + hits / 60;

    Ok(Json(json!({
        "version": VERSION,
        "uptime": uptime_string(state.started_at.elapsed()),
        "db_uptime": section("Server", "uptime_in_seconds"),
        "db_version": section("Server", "redis_version"),
        "expired_keys__since_restart": section("Stats", "expired_keys"),
        "key_misses__since_restart": section("Stats", "keyspace_misses"),
        "commands": {
            "total": total,
            "get": gets,
            "hit": hits,
            "create": creates,
        },
        "total_keys": total_keys,
        "shard": &*state.shard,
        "stream": state.engine.stats(),
    }))
    .into_response())
}

/// Read a flushed `stats:*` counter, treating anything unreadable as zero
async fn read_stat(state: &AppState, key: &str) -> i64 {
    state
        .store
        .get(&format!("stats:{key}"))
        .await
        .ok()
        .flatten()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Parse the section-formatted server info string (`# Section` headers,
/// `key:value` lines) into nested maps.
fn parse_info_sections(raw: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut name = String::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(header) = line.strip_prefix("# ") {
            name = header.to_owned();
            sections.entry(name.clone()).or_default();
        } else if let Some((key, value)) = line.split_once(':') {
            if let Some(section) = sections.get_mut(&name) {
                section.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }
    }
    sections
}

fn uptime_string(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, rem) = (secs / 3600, secs % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
