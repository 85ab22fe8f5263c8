//! SSE subscription handler
//!
//! Implements the subscription lifecycle: register a sink with the engine,
//! push the counter's current value as a baseline frame, then relay every
//! published update as `data: {"value":N}` frames until the client
//! disconnects. Dropping the response stream drops the [`Subscription`],
//! whose guard schedules the engine-side removal within its bounded budget.
//!
//! Missed publishes are not retransmitted; a reconnecting client starts
//! from a fresh baseline.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, StreamExt};
use tracing::debug;

use super::handlers::resolve_name;
use super::{ApiError, AppState};

fn value_frame(value: i64) -> Event {
    Event::default().data(format!("{{\"value\":{value}}}"))
}

pub(super) async fn stream_counter(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = resolve_name(&params, &headers)?;
    let data_id = name.data_id();

    let subscription = state.engine.subscribe(data_id.clone()).await;
    debug!(counter = %name, "stream subscriber attached");

    // Baseline frame: the current value, read after registration so the
    // client never observes a gap between the snapshot and the first
    // published update. A missing counter simply sends no baseline.
    let baseline = state.counters.peek(&data_id).await;

    let updates = stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|value| (value_frame(value), subscription))
    });
    let frames = stream::iter(baseline.map(value_frame))
        .chain(updates)
        .map(Ok::<_, Infallible>);

    let mut response = Sse::new(frames).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}
