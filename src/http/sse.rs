//! Tail-follow SSE bridge — §6 `GET /v1/sessions/{id}/tail?follow=1`.
//! Replays the persisted item backlog, then streams live `CodexEvent`s off
//! the session's `Subscription` as they arrive. Ported from the daemon's
//! `rest::sse::session_events_sse` stream-bridging shape, generalized from
//! one broadcast string channel to the typed per-session `Hub`.

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ArchonError;
use crate::hub::Delivered;
use crate::model::Item;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    follow: Option<String>,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    lines: Option<String>,
}

pub async fn tail(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<axum::response::Response, ArchonError> {
    let n = crate::util::parse_lines(query.lines.as_deref());
    if !crate::util::parse_truthy(query.follow.as_deref()) {
        let items = state.session_manager.tail(&session_id, Some(n)).await?;
        return Ok(axum::Json(serde_json::json!({ "items": items })).into_response());
    }

    let backlog = state.session_manager.tail(&session_id, Some(n)).await?;
    let sub = state.session_manager.subscribe(&session_id).await?;
    let stream_filter = query.stream.unwrap_or_else(|| "combined".to_string());

    Ok(Sse::new(tail_stream(backlog, sub, stream_filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response())
}

fn item_matches(item_stream: Option<&str>, filter: &str) -> bool {
    filter == "combined" || item_stream.map(|s| s == filter).unwrap_or(true)
}

fn tail_stream(
    backlog: Vec<Item>,
    sub: crate::hub::Subscription<crate::model::CodexEvent>,
    filter: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let replay = stream::iter(backlog.into_iter().filter_map(move |item| {
        let stream_field = item.fields.get("stream").and_then(|v| v.as_str()).map(|s| s.to_string());
        if !item_matches(stream_field.as_deref(), &filter) {
            return None;
        }
        let data = serde_json::to_string(&item).unwrap_or_default();
        Some(Ok(Event::default().event("log").data(data)))
    }));

    let live = stream::unfold((sub, filter), |(mut sub, filter)| async move {
        loop {
            match sub.recv().await {
                Delivered::Event(event) => {
                    let stream_field = event.params.get("stream").and_then(|v| v.as_str()).map(|s| s.to_string());
                    if !item_matches(stream_field.as_deref(), &filter) {
                        continue;
                    }
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event("log").data(data)), (sub, filter)));
                }
                Delivered::Gap { skipped } => {
                    let data = serde_json::json!({ "error": "gap", "skipped": skipped }).to_string();
                    return Some((Ok(Event::default().event("error").data(data)), (sub, filter)));
                }
                Delivered::Closed => return None,
            }
        }
    });

    replay.chain(live)
}
