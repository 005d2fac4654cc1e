//! Run SSE stream: `GET /v1/threads/:thread_id/runs/:run_id/events`.
//!
//! Resumable by `Last-Event-ID` or `?after_seq=`: if the run's in-memory
//! buffer is still live this reads from it directly; otherwise (buffer
//! already reaped, or the caller is resuming after a restart) it replays
//! from the durable `run_events` log first, then — if the run is still the
//! thread's current one — switches over to the live buffer for anything
//! appended since.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, Stream, StreamExt};

use crate::state::AppState;

#[derive(serde::Deserialize)]
pub struct RunEventsQuery {
    pub after_seq: Option<i64>,
}

fn to_sse_event(event: &sbx_domain::run_event::RunEvent) -> Event {
    Event::default().id(event.seq.to_string()).event(event.event_type.clone()).json_data(&event.data).unwrap_or_else(
        |_| Event::default().id(event.seq.to_string()).event(event.event_type.clone()).data("null"),
    )
}

/// `GET /v1/threads/:thread_id/runs/:run_id/events`
pub async fn run_events_sse(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<RunEventsQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let resume_from = query
        .after_seq
        .or_else(|| headers.get("last-event-id").and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<i64>().ok()))
        .unwrap_or(0);

    let mut cursor = resume_from;
    let backlog: Vec<Event> = match sbx_storage::run_events::list_after(&state.pool, &thread_id, &run_id, resume_from).await
    {
        Ok(rows) => rows
            .into_iter()
            .map(|r| {
                cursor = r.seq;
                let data: serde_json::Value = serde_json::from_str(&r.data_json).unwrap_or(serde_json::Value::Null);
                Event::default().id(r.seq.to_string()).event(r.event_type).json_data(&data).unwrap_or_else(|_| {
                    Event::default().id(r.seq.to_string()).data("null")
                })
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "run sse: failed to load backlog");
            Vec::new()
        }
    };

    let buffer = state.run_registry.get_buffer(&run_id);
    let keepalive_secs = state.config.engine.run_buffer_keepalive_sec.max(1);

    let live_stream = async_stream::stream! {
        let mut after = cursor;
        let Some(buffer) = buffer else {
            return;
        };
        loop {
            let (batch, done) = buffer.next_batch(after, Duration::from_secs(keepalive_secs)).await;
            for event in &batch {
                after = event.seq;
                yield Ok::<Event, Infallible>(to_sse_event(event));
            }
            if batch.is_empty() {
                yield Ok(Event::default().comment("keepalive"));
            }
            if done && batch.is_empty() {
                break;
            }
        }
    };

    // The stream opens with a `retry: 5000` hint so a client's EventSource
    // reconnects quickly if the connection drops.
    let retry_hint = stream::once(async { Ok::<Event, Infallible>(Event::default().retry(Duration::from_millis(5000))) });
    let combined = retry_hint.chain(stream::iter(backlog.into_iter().map(Ok::<Event, Infallible>))).chain(live_stream);
    Sse::new(combined).keep_alive(KeepAlive::new().interval(Duration::from_secs(keepalive_secs)).text("keepalive"))
}

pub fn _assert_stream<S: Stream<Item = Result<Event, Infallible>>>(_: S) {}
